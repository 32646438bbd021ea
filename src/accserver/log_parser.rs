use std::convert::TryFrom;
use std::num::ParseIntError;
use std::str::FromStr;

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::future;
use async_std::prelude::*;
use async_std::task;
use once_cell::sync::Lazy;
use regex::{ Captures, Regex };

use crate::accserver::{ SessionPhase, SessionType };
use crate::accserver::server_log::LogLine;

const EVENT_BUFFER: usize = 16;

/// Flags of a completed lap as printed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LapFlags(pub u32);

impl LapFlags {
    pub const HAS_CUT: u32 = 1;
    pub const OUT_LAP: u32 = 4;
    pub const IN_LAP: u32 = 8;

    pub fn has_cut(self) -> bool {
        self.0 & LapFlags::HAS_CUT != 0
    }

    pub fn is_out_lap(self) -> bool {
        self.0 & LapFlags::OUT_LAP != 0
    }

    pub fn is_in_lap(self) -> bool {
        self.0 & LapFlags::IN_LAP != 0
    }

    /// Other bits (session over and the like) do not matter for the best lap
    pub fn counts_for_best_lap(self) -> bool {
        !self.has_cut() && !self.is_out_lap() && !self.is_in_lap()
    }
}

/// Everything of interest the server reports in its log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ServerStarting { version: u32 },
    LobbyConnectionFailed,
    LobbyConnectionSucceeded,
    /// Drivers and spectators together
    NrClientsOnline { nr_clients: u32 },
    Track { label: String },
    SessionPhaseChanged { session_type: SessionType, phase: SessionPhase },
    ResettingWeekend,
    NewConnectionRequest { connection_id: u32, player_name: String, player_id: String, car_model_id: u32 },
    NewCarConnection { car_id: u32, car_model_id: u32, race_number: u32 },
    DeadConnection { connection_id: u32 },
    /// No driver is connected for the car anymore
    CarRemoved { car_id: u32 },
    /// The car id is retired
    CarPurged { car_id: u32 },
    NewLapTime { car_id: u32, lap_time_ms: u32, timestamp_ms: u64, flags: LapFlags },
    /// Starting grid, printed at the end of qualifying
    GridPosition { car_id: u32, position: u32 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid number `{value}`: {source}")]
    InvalidNumber {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("{0}")]
    UnknownSessionType(String),
    #[error("lap time {0} is out of range")]
    LapTimeOutOfRange(String),
}

type Build = fn(&Captures) -> Result<Option<Event>, ParseError>;

struct Rule {
    pattern: Regex,
    build: Build,
}

fn rule(pattern: &str, build: Build) -> Option<Rule> {
    match Regex::new(pattern) {
        Ok(pattern) => Some(Rule { pattern, build }),
        Err(err) => {
            error!("Invalid log pattern `{}`: {}", pattern, err);
            None
        },
    }
}

fn text<'t>(captures: &Captures<'t>, index: usize) -> &'t str {
    captures.get(index).map_or("", |capture| capture.as_str())
}

fn number<T: FromStr<Err = ParseIntError>>(captures: &Captures, index: usize) -> Result<T, ParseError> {
    let value = text(captures, index);
    value.parse()
        .map_err(|source| ParseError::InvalidNumber { value: value.to_string(), source })
}

fn lap_time_ms(captures: &Captures, minutes: usize, seconds: usize, millis: usize) -> Result<u32, ParseError> {
    let (m, s, ms): (u32, u32, u32) = (number(captures, minutes)?, number(captures, seconds)?, number(captures, millis)?);
    m.checked_mul(60_000)
        .and_then(|total| s.checked_mul(1_000).and_then(|s| total.checked_add(s)))
        .and_then(|total| total.checked_add(ms))
        .ok_or_else(|| ParseError::LapTimeOutOfRange(format!("{}:{}:{}", m, s, ms)))
}

/// Tried in order, the first matching rule decides
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"^Server starting with version (\d+)$",
            |c| Ok(Some(Event::ServerStarting { version: number(c, 1)? }))),
        rule(r"RegisterToLobby TCP connection failed",
            |_| Ok(Some(Event::LobbyConnectionFailed))),
        rule(r"RegisterToLobby succeeded",
            |_| Ok(Some(Event::LobbyConnectionSucceeded))),
        rule(r"^(\d+) client\(s\) online$",
            |c| Ok(Some(Event::NrClientsOnline { nr_clients: number(c, 1)? }))),
        rule(r"^Track ([a-zA-Z0-9_]+) was set and updated$",
            |c| Ok(Some(Event::Track { label: text(c, 1).to_string() }))),
        rule(r"^Detected sessionPhase <([A-Za-z ]+)> -> <([A-Za-z ]+)> \(([A-Za-z ]+)\)$",
            |c| Ok(Some(Event::SessionPhaseChanged {
                session_type: SessionType::try_from(text(c, 3)).map_err(ParseError::UnknownSessionType)?,
                phase: SessionPhase::from(text(c, 2)),
            }))),
        rule(r"Resetting race weekend",
            |_| Ok(Some(Event::ResettingWeekend))),
        rule(r"^New connection request: id (\d+) (.+) (S\d+) on car model (\d+)$",
            |c| Ok(Some(Event::NewConnectionRequest {
                connection_id: number(c, 1)?,
                player_name: text(c, 2).to_string(),
                player_id: text(c, 3).to_string(),
                car_model_id: number(c, 4)?,
            }))),
        rule(r"^Creating new car connection: carId (\d+), carModel (\d+), raceNumber #(\d+)$",
            |c| Ok(Some(Event::NewCarConnection {
                car_id: number(c, 1)?,
                car_model_id: number(c, 2)?,
                race_number: number(c, 3)?,
            }))),
        rule(r"Removing dead connection (\d+)",
            |c| Ok(Some(Event::DeadConnection { connection_id: number(c, 1)? }))),
        rule(r"^car (\d+) has no driving connection anymore, will remove it$",
            |c| Ok(Some(Event::CarRemoved { car_id: number(c, 1)? }))),
        rule(r"^Purging car_id (\d+)$",
            |c| Ok(Some(Event::CarPurged { car_id: number(c, 1)? }))),
        // Printed by older servers, the `Lap carId` line carries the same lap with a timestamp
        rule(r"^New laptime: (\d+) for carId (\d+) with lapstates: [a-zA-Z, ]* \(raw (\d+)\)$",
            |_| Ok(None)),
        rule(r"^Lap carId (\d+), driverId (\d+), lapTime (\d+):(\d+):(\d+), timestampMS (\d+)(?:\.\d*)?, flags: (?:%d)?(\d+)",
            |c| Ok(Some(Event::NewLapTime {
                car_id: number(c, 1)?,
                lap_time_ms: lap_time_ms(c, 3, 4, 5)?,
                timestamp_ms: number(c, 6)?,
                flags: LapFlags(number(c, 7)?),
            }))),
        rule(r"^\s*Car (\d+) Pos (\d+)$",
            |c| Ok(Some(Event::GridPosition { car_id: number(c, 1)?, position: number(c, 2)? }))),
    ].into_iter().flatten().collect()
});

/// Translates a single log line; lines not matching any rule give no event
pub fn parse_line(line: &str) -> Result<Option<Event>, ParseError> {
    for rule in RULES.iter() {
        if let Some(captures) = rule.pattern.captures(line) {
            return (rule.build)(&captures);
        }
    }
    Ok(None)
}

/// Turns a stream of log lines into a stream of events.
///
/// The event stream is closed when the log stream is closed or when [`LogParser::close`] is called.
pub struct LogParser {
    events: Receiver<Event>,
    close: Sender<()>,
}

impl LogParser {
    pub fn spawn(log: Receiver<LogLine>) -> LogParser {
        let (event_sender, events) = channel::bounded(EVENT_BUFFER);
        let (close, close_receiver) = channel::bounded(1);

        task::spawn(parse_log(log, close_receiver, event_sender));

        LogParser { events, close }
    }

    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    pub fn close(&self) {
        if self.close.try_send(()).is_err() {
            debug!("Log parser already closing");
        }
    }
}

/// Completes once a close is requested; never completes if the parser handle is dropped without closing
async fn close_requested(close: &Receiver<()>) {
    if close.recv().await.is_err() {
        future::pending::<()>().await;
    }
}

async fn parse_log(log: Receiver<LogLine>, close: Receiver<()>, events: Sender<Event>) {
    loop {
        let next = {
            let line = async { log.recv().await.ok() };
            let closed = async {
                close_requested(&close).await;
                None
            };
            line.race(closed).await
        };
        let line = match next {
            Some(line) => line,
            None => break,
        };

        let event = match parse_line(&line.text) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                warn!("Error ({}) while parsing log line `{}`", err, line.text);
                continue;
            },
        };

        let delivered = async { events.send(event).await.is_ok() };
        let closed = async {
            close_requested(&close).await;
            false
        };
        if !delivered.race(closed).await {
            break;
        }
    }

    debug!("Log parser finished");
}
