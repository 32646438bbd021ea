use std::cmp::Ordering;
use std::collections::{ BTreeMap, HashMap, VecDeque };
use std::sync::Arc;

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::prelude::*;
use async_std::sync::Mutex;
use async_std::task;

use crate::accdata::{ ReferenceData, Track };
use crate::accserver::{ CarState, PendingConnectionRequest, ServerStatus, SessionState, SessionType };
use crate::accserver::live_events::{ self, LiveStateEvents, Subscriber, Update };
use crate::accserver::log_parser::{ Event, LapFlags };

/// The live state of the server as reconstructed from its log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveState {
    pub server_status: ServerStatus,
    pub nr_clients: u32,
    pub track: Option<Arc<Track>>,
    pub session_state: SessionState,
    pub cars: BTreeMap<u32, CarState>,
}

impl LiveState {
    pub fn is_running(&self) -> bool {
        matches!(self.server_status, ServerStatus::NotRegistered | ServerStatus::Online)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("unknown car {0}")]
    UnknownCar(u32),
    #[error("unknown connection {0}")]
    UnknownConnection(u32),
    #[error("position {position} for car {car_id} is outside 1..={nr_cars}")]
    InvalidPosition {
        car_id: u32,
        position: u32,
        nr_cars: u32,
    },
}

struct Inner {
    state: LiveState,
    subscribers: Vec<Subscriber>,
    pending_requests: VecDeque<PendingConnectionRequest>,
    car_per_connection: HashMap<u32, u32>,
    /// Only the event loop holding this token may change the state
    current_token: u64,
    stop_current: Option<Sender<()>>,
}

/// Maintains the live state from the events of the current server instance.
///
/// Every change is sent to all attached subscribers, in the order the changes happen.
#[derive(Clone)]
pub struct LiveStateEngine {
    reference: Arc<ReferenceData>,
    inner: Arc<Mutex<Inner>>,
}

impl LiveStateEngine {
    pub fn new(reference: Arc<ReferenceData>) -> LiveStateEngine {
        let state = LiveState {
            server_status: ServerStatus::Offline,
            nr_clients: 0,
            track: reference.tracks().first().cloned(),
            session_state: SessionState::default(),
            cars: BTreeMap::new(),
        };

        LiveStateEngine {
            reference,
            inner: Arc::new(Mutex::new(Inner {
                state,
                subscribers: vec![],
                pending_requests: VecDeque::new(),
                car_per_connection: HashMap::new(),
                current_token: 0,
                stop_current: None,
            })),
        }
    }

    /// Subscribes to all future changes of the live state.
    ///
    /// Changes are delivered while the state is locked. Until a stalled subscriber reads
    /// again, every other call on the engine waits as well: `attach`, `snapshot`,
    /// `is_running`, `new_instance` (and with it `AccServer::start`) and `shutdown`.
    /// A subscriber must therefore keep reading its channels without waiting on any of
    /// those in between.
    pub async fn attach(&self) -> LiveStateEvents {
        let (subscriber, events) = live_events::subscription();
        self.inner.lock().await.subscribers.push(subscriber);
        events
    }

    pub async fn snapshot(&self) -> LiveState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.state.is_running()
    }

    /// Starts following the events of a new server instance, ignoring the previous one from now on
    pub async fn new_instance(&self, events: Receiver<Event>) {
        let (stop, stop_receiver) = channel::bounded(1);
        let token = {
            let mut inner = self.inner.lock().await;
            if let Some(previous) = inner.stop_current.replace(stop) {
                if previous.try_send(()).is_err() {
                    debug!("Previous live state loop already stopped");
                }
            }
            inner.current_token += 1;
            inner.current_token
        };

        let engine = self.clone();
        task::spawn(async move {
            engine.follow(events, stop_receiver, token).await
        });
    }

    /// Stops following the current instance and closes the channels of all subscribers
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.current_token += 1;
        inner.stop_current = None;
        inner.subscribers.clear();
        info!("Live state shut down");
    }

    async fn follow(&self, events: Receiver<Event>, stop: Receiver<()>, token: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.current_token == token {
                inner.reset_connections();
                inner.set_server_status(ServerStatus::Starting).await;
                inner.set_nr_clients(0).await;
            }
        }

        let mut superseded = false;
        loop {
            let next = if superseded {
                events.recv().await.map_or(Next::Ended, Next::Event)
            } else {
                let event = async { events.recv().await.map_or(Next::Ended, Next::Event) };
                let stopped = async {
                    stop.recv().await.ok();
                    Next::Stopped
                };
                event.race(stopped).await
            };

            match next {
                Next::Event(event) => self.handle(token, &event).await,
                Next::Stopped => {
                    debug!("Live state loop {} superseded", token);
                    superseded = true;
                },
                Next::Ended => break,
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.current_token == token {
            inner.go_offline().await;
        }
    }

    async fn handle(&self, token: u64, event: &Event) {
        let mut inner = self.inner.lock().await;
        if inner.current_token != token {
            return;
        }

        if let Err(err) = inner.handle(&self.reference, event).await {
            warn!("Unable to handle log event ({:?}): {}", event, err);
        }
    }
}

enum Next {
    Event(Event),
    Stopped,
    Ended,
}

impl Inner {
    async fn handle(&mut self, reference: &ReferenceData, event: &Event) -> Result<(), HandlerError> {
        match event {
            Event::ServerStarting { version } => {
                info!("Server version {} is starting", version);
                self.set_server_status(ServerStatus::NotRegistered).await;
            },
            Event::LobbyConnectionFailed => self.set_server_status(ServerStatus::NotRegistered).await,
            Event::LobbyConnectionSucceeded => self.set_server_status(ServerStatus::Online).await,
            Event::NrClientsOnline { nr_clients } => self.set_nr_clients(*nr_clients).await,
            Event::Track { label } => match reference.track_by_label(label) {
                Some(track) => self.set_track(track).await,
                None => debug!("Ignoring unknown track {}", label),
            },
            Event::SessionPhaseChanged { session_type, phase } => {
                let previous_type = self.state.session_state.session_type;
                self.set_session_state(SessionState { session_type: *session_type, phase: phase.clone() }).await;
                if previous_type != *session_type {
                    self.advance_session().await;
                }
            },
            Event::ResettingWeekend => debug!("Race weekend is reset"),
            Event::NewConnectionRequest { connection_id, player_name, player_id, car_model_id } => {
                self.pending_requests.push_back(PendingConnectionRequest {
                    connection_id: *connection_id,
                    player_name: player_name.clone(),
                    player_id: player_id.clone(),
                    car_model_id: *car_model_id,
                });
            },
            Event::NewCarConnection { car_id, car_model_id, race_number } => {
                self.connect_car(reference, *car_id, *car_model_id, *race_number).await;
            },
            Event::DeadConnection { connection_id } => self.remove_connection(*connection_id).await?,
            Event::CarRemoved { car_id } => debug!("Car {} has no connection left, it stays until purged", car_id),
            Event::CarPurged { car_id } => {
                self.purge_car(*car_id).await;
                self.recalculate_positions().await;
            },
            Event::NewLapTime { car_id, lap_time_ms, timestamp_ms, flags } => {
                self.complete_lap(*car_id, *lap_time_ms, *timestamp_ms, *flags).await?;
            },
            Event::GridPosition { car_id, position } => self.set_grid_position(*car_id, *position).await?,
        }
        Ok(())
    }

    /// Sends the update to every subscriber, dropping the ones that went away
    async fn announce(&mut self, update: Update) {
        let subscribers = std::mem::take(&mut self.subscribers);
        for subscriber in subscribers {
            if subscriber.notify(&update).await {
                self.subscribers.push(subscriber);
            } else {
                debug!("Dropping live state subscriber that went away");
            }
        }
    }

    async fn set_server_status(&mut self, status: ServerStatus) {
        self.state.server_status = status;
        self.announce(Update::ServerStatus(status)).await;
    }

    async fn set_nr_clients(&mut self, nr_clients: u32) {
        self.state.nr_clients = nr_clients;
        self.announce(Update::NrClients(nr_clients)).await;
    }

    async fn set_track(&mut self, track: Arc<Track>) {
        self.state.track = Some(track.clone());
        self.announce(Update::Track(track)).await;
    }

    async fn set_session_state(&mut self, session_state: SessionState) {
        self.state.session_state = session_state.clone();
        self.announce(Update::SessionState(session_state)).await;
    }

    async fn announce_car(&mut self, car_id: u32) {
        if let Some(car) = self.state.cars.get(&car_id).cloned() {
            self.announce(Update::CarState(car)).await;
        }
    }

    async fn purge_car(&mut self, car_id: u32) {
        if self.state.cars.remove(&car_id).is_none() {
            debug!("Purged car {} was not known", car_id);
            return;
        }
        self.car_per_connection.retain(|_connection_id, car| *car != car_id);
        self.announce(Update::CarPurged(car_id)).await;
    }

    fn reset_connections(&mut self) {
        self.pending_requests.clear();
        self.car_per_connection.clear();
    }

    async fn go_offline(&mut self) {
        self.set_server_status(ServerStatus::Offline).await;

        let car_ids: Vec<u32> = self.state.cars.keys().copied().collect();
        for car_id in car_ids {
            self.purge_car(car_id).await;
        }
        self.reset_connections();
    }

    /// Takes the oldest pending request for the given car model
    fn take_pending_request(&mut self, car_model_id: u32) -> Option<PendingConnectionRequest> {
        let index = self.pending_requests.iter().position(|request| request.car_model_id == car_model_id)?;
        self.pending_requests.remove(index)
    }

    async fn connect_car(&mut self, reference: &ReferenceData, car_id: u32, car_model_id: u32, race_number: u32) {
        let driver = self.take_pending_request(car_model_id)
            .map(PendingConnectionRequest::into_driver);
        let car_model = reference.car_model_by_id(car_model_id);
        if car_model.is_none() {
            debug!("Car {} has unknown car model {}", car_id, car_model_id);
        }

        // Positions are always 1..=N, so the slot after the last one is free
        let new_position = self.state.cars.len() as u32 + 1;
        let car = self.state.cars.entry(car_id)
            .or_insert_with(|| CarState::new(car_id, new_position));
        car.race_number = race_number;
        car.car_model_id = car_model_id;
        car.car_model = car_model;

        match driver {
            Some(driver) => {
                self.car_per_connection.insert(driver.connection_id, car_id);
                if car.current_driver.is_none() {
                    car.current_driver = Some(driver.clone());
                }
                car.drivers.push(driver);
            },
            None => warn!("No connection request for car {} with car model {}", car_id, car_model_id),
        }

        self.announce_car(car_id).await;
    }

    async fn remove_connection(&mut self, connection_id: u32) -> Result<(), HandlerError> {
        if let Some(car_id) = self.car_per_connection.remove(&connection_id) {
            if let Some(car) = self.state.cars.get_mut(&car_id) {
                car.drivers.retain(|driver| driver.connection_id != connection_id);
            }
            self.announce_car(car_id).await;
            return Ok(());
        }

        let nr_pending = self.pending_requests.len();
        self.pending_requests.retain(|request| request.connection_id != connection_id);
        if self.pending_requests.len() < nr_pending {
            debug!("Connection {} died before getting a car", connection_id);
            Ok(())
        } else {
            Err(HandlerError::UnknownConnection(connection_id))
        }
    }

    async fn complete_lap(&mut self, car_id: u32, lap_time_ms: u32, timestamp_ms: u64, flags: LapFlags) -> Result<(), HandlerError> {
        let car = self.state.cars.get_mut(&car_id)
            .ok_or(HandlerError::UnknownCar(car_id))?;

        car.laps_completed = car.laps_completed.saturating_add(1);
        car.last_lap_ms = lap_time_ms;
        car.last_lap_timestamp_ms = timestamp_ms;
        if flags.counts_for_best_lap() && (car.best_lap_ms == 0 || lap_time_ms < car.best_lap_ms) {
            car.best_lap_ms = lap_time_ms;
        }

        self.announce_car(car_id).await;
        self.recalculate_positions().await;
        Ok(())
    }

    /// Moves the car to its grid slot; the car holding that slot takes over the old position
    async fn set_grid_position(&mut self, car_id: u32, position: u32) -> Result<(), HandlerError> {
        let nr_cars = self.state.cars.len() as u32;
        let previous = self.state.cars.get(&car_id)
            .ok_or(HandlerError::UnknownCar(car_id))?
            .position;
        if position == 0 || position > nr_cars {
            return Err(HandlerError::InvalidPosition { car_id, position, nr_cars });
        }
        if previous == position {
            return Ok(());
        }

        let displaced = self.state.cars.values()
            .find(|car| car.position == position)
            .map(|car| car.car_id);
        if let Some(car) = self.state.cars.get_mut(&car_id) {
            car.position = position;
        }
        self.announce_car(car_id).await;

        if let Some(displaced) = displaced {
            if let Some(car) = self.state.cars.get_mut(&displaced) {
                car.position = previous;
            }
            self.announce_car(displaced).await;
        }
        Ok(())
    }

    /// A new session type starts: lap statistics start over and cars without drivers are gone
    async fn advance_session(&mut self) {
        let car_ids: Vec<u32> = self.state.cars.keys().copied().collect();
        for car_id in car_ids {
            let has_drivers = self.state.cars.get(&car_id)
                .map_or(false, |car| !car.drivers.is_empty());
            if has_drivers {
                if let Some(car) = self.state.cars.get_mut(&car_id) {
                    car.reset_laps();
                }
                self.announce_car(car_id).await;
            } else {
                self.purge_car(car_id).await;
            }
        }

        self.recalculate_positions().await;
    }

    async fn recalculate_positions(&mut self) {
        let compare: fn(&CarState, &CarState) -> Ordering = match self.state.session_state.session_type {
            SessionType::Race => compare_race_progress,
            SessionType::Practice | SessionType::Qualifying => compare_best_lap,
        };

        let mut cars: Vec<&CarState> = self.state.cars.values().collect();
        cars.sort_by(|a, b| compare(a, b));

        let changed: Vec<(u32, u32)> = cars.iter()
            .zip(1..)
            .filter(|(car, position)| car.position != *position)
            .map(|(car, position)| (car.car_id, position))
            .collect();

        for (car_id, position) in changed {
            if let Some(car) = self.state.cars.get_mut(&car_id) {
                car.position = position;
            }
            self.announce_car(car_id).await;
        }
    }
}

/// Most laps first, then who completed the last lap first
fn compare_race_progress(a: &CarState, b: &CarState) -> Ordering {
    b.laps_completed.cmp(&a.laps_completed)
        .then(a.last_lap_timestamp_ms.cmp(&b.last_lap_timestamp_ms))
        .then(a.position.cmp(&b.position))
}

/// Fastest best lap first, cars without a best lap last
fn compare_best_lap(a: &CarState, b: &CarState) -> Ordering {
    let by_best_lap = match (a.best_lap_ms, b.best_lap_ms) {
        (0, 0) => Ordering::Equal,
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (a_best, b_best) => a_best.cmp(&b_best),
    };
    by_best_lap.then(a.position.cmp(&b.position))
}
