pub mod instance;
pub mod server_log;
pub mod log_parser;
pub mod live_events;
pub mod live_state;
pub mod server;

use std::fmt;
use std::sync::Arc;
use std::convert::TryFrom;

use crate::accdata::CarModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Offline,
    Starting,
    NotRegistered,
    Online,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Starting => "starting",
            ServerStatus::NotRegistered => "not_registered",
            ServerStatus::Online => "online",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Practice,
    Qualifying,
    Race,
}

impl TryFrom<&str> for SessionType {
    type Error = String;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        match name {
            "Practice" => Ok(SessionType::Practice),
            "Qualifying" => Ok(SessionType::Qualifying),
            "Race" => Ok(SessionType::Race),
            _ => Err(format!("unknown session type `{}`", name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    WaitingForDrivers,
    PreSession,
    Formation,
    SingleFile,
    DoubleFile,
    Session,
    SessionOvertime,
    SessionCompleted,
    PostSession,
    ResultUi,
    /// A phase name the server printed that is not known here
    Other(String),
}

impl From<&str> for SessionPhase {
    fn from(name: &str) -> Self {
        match name {
            "waiting for drivers" => SessionPhase::WaitingForDrivers,
            "pre session" => SessionPhase::PreSession,
            "formation" => SessionPhase::Formation,
            "singleFile" => SessionPhase::SingleFile,
            "doubleFile" => SessionPhase::DoubleFile,
            "session" => SessionPhase::Session,
            "session overtime" => SessionPhase::SessionOvertime,
            "session completed" => SessionPhase::SessionCompleted,
            "post session" => SessionPhase::PostSession,
            "result UI" => SessionPhase::ResultUi,
            other => SessionPhase::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session_type: SessionType,
    pub phase: SessionPhase,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            session_type: SessionType::Practice,
            phase: SessionPhase::WaitingForDrivers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Driver {
    pub connection_id: u32,
    pub name: String,
    pub player_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CarState {
    pub car_id: u32,
    pub race_number: u32,
    pub car_model_id: u32,
    pub car_model: Option<Arc<CarModel>>,
    pub drivers: Vec<Driver>,
    pub current_driver: Option<Driver>,
    pub position: u32,
    pub laps_completed: u32,
    /// Zero until a lap counting for the best lap was driven
    pub best_lap_ms: u32,
    pub last_lap_ms: u32,
    pub last_lap_timestamp_ms: u64,
}

impl CarState {
    pub fn new(car_id: u32, position: u32) -> CarState {
        CarState {
            car_id,
            position,
            ..CarState::default()
        }
    }

    fn reset_laps(&mut self) {
        self.laps_completed = 0;
        self.best_lap_ms = 0;
        self.last_lap_ms = 0;
        self.last_lap_timestamp_ms = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnectionRequest {
    pub connection_id: u32,
    pub player_name: String,
    pub player_id: String,
    pub car_model_id: u32,
}

impl PendingConnectionRequest {
    fn into_driver(self) -> Driver {
        Driver {
            connection_id: self.connection_id,
            name: self.player_name,
            player_id: self.player_id,
        }
    }
}
