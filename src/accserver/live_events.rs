use std::sync::Arc;

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::stream::{ Stream, StreamExt };
use async_trait::async_trait;

use crate::accdata::Track;
use crate::accserver::{ CarState, ServerStatus, SessionState };

/// Updates a subscriber may lag behind before the live state blocks on it
const SUBSCRIBER_BUFFER: usize = 64;

/// A single change to the live state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    ServerStatus(ServerStatus),
    NrClients(u32),
    Track(Arc<Track>),
    SessionState(SessionState),
    CarState(CarState),
    CarPurged(u32),
}

/// Channels for all types of live state updates.
///
/// All channels must be read until they are closed, a subscriber that stops reading
/// eventually blocks the live state. All channels are closed at the same time, but
/// there is no guarantee about pending updates on other channels when one is closed;
/// [`LiveStateEvents::flush`] empties all of them.
pub struct LiveStateEvents {
    pub server_status: Receiver<ServerStatus>,
    pub nr_clients: Receiver<u32>,
    pub track: Receiver<Arc<Track>>,
    pub session_state: Receiver<SessionState>,
    pub car_state: Receiver<CarState>,
    pub car_purged: Receiver<u32>,
}

#[async_trait]
pub trait StateTracker: Send {
    async fn process(&mut self, update: &Update);
}

impl LiveStateEvents {
    /// Merges all channels into one stream, which ends once every channel is closed.
    ///
    /// Updates of the same kind keep their order.
    pub fn into_stream(self) -> impl Stream<Item = Update> + Send {
        self.server_status.map(Update::ServerStatus)
            .merge(self.nr_clients.map(Update::NrClients))
            .merge(self.track.map(Update::Track))
            .merge(self.session_state.map(Update::SessionState))
            .merge(self.car_state.map(Update::CarState))
            .merge(self.car_purged.map(Update::CarPurged))
    }

    /// Feeds every update to `tracker` until the live state shuts down
    pub async fn feed<T: StateTracker>(self, tracker: &mut T) {
        let mut updates = Box::pin(self.into_stream());
        while let Some(update) = updates.next().await {
            tracker.process(&update).await;
        }
    }

    /// Reads all remaining updates on all channels until they are closed
    pub async fn flush(self) {
        self.into_stream().for_each(|_| {}).await;
    }
}

/// Sending side of a [`LiveStateEvents`] bundle
pub(crate) struct Subscriber {
    server_status: Sender<ServerStatus>,
    nr_clients: Sender<u32>,
    track: Sender<Arc<Track>>,
    session_state: Sender<SessionState>,
    car_state: Sender<CarState>,
    car_purged: Sender<u32>,
}

impl Subscriber {
    /// Blocks until the update is accepted; false once the subscriber went away
    pub(crate) async fn notify(&self, update: &Update) -> bool {
        match update {
            Update::ServerStatus(status) => self.server_status.send(*status).await.is_ok(),
            Update::NrClients(nr_clients) => self.nr_clients.send(*nr_clients).await.is_ok(),
            Update::Track(track) => self.track.send(track.clone()).await.is_ok(),
            Update::SessionState(state) => self.session_state.send(state.clone()).await.is_ok(),
            Update::CarState(car) => self.car_state.send(car.clone()).await.is_ok(),
            Update::CarPurged(car_id) => self.car_purged.send(*car_id).await.is_ok(),
        }
    }
}

pub(crate) fn subscription() -> (Subscriber, LiveStateEvents) {
    let (server_status, server_status_receiver) = channel::bounded(SUBSCRIBER_BUFFER);
    let (nr_clients, nr_clients_receiver) = channel::bounded(SUBSCRIBER_BUFFER);
    let (track, track_receiver) = channel::bounded(SUBSCRIBER_BUFFER);
    let (session_state, session_state_receiver) = channel::bounded(SUBSCRIBER_BUFFER);
    let (car_state, car_state_receiver) = channel::bounded(SUBSCRIBER_BUFFER);
    let (car_purged, car_purged_receiver) = channel::bounded(SUBSCRIBER_BUFFER);

    (
        Subscriber { server_status, nr_clients, track, session_state, car_state, car_purged },
        LiveStateEvents {
            server_status: server_status_receiver,
            nr_clients: nr_clients_receiver,
            track: track_receiver,
            session_state: session_state_receiver,
            car_state: car_state_receiver,
            car_purged: car_purged_receiver,
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use async_std::future::timeout;

    struct Recorder {
        updates: Vec<Update>,
    }

    #[async_trait]
    impl StateTracker for Recorder {
        async fn process(&mut self, update: &Update) {
            self.updates.push(update.clone());
        }
    }

    #[async_std::test]
    async fn tracker_sees_updates_in_order_per_kind() {
        let (subscriber, events) = subscription();
        assert!(subscriber.notify(&Update::NrClients(1)).await);
        assert!(subscriber.notify(&Update::ServerStatus(ServerStatus::Starting)).await);
        assert!(subscriber.notify(&Update::NrClients(2)).await);
        assert!(subscriber.notify(&Update::CarPurged(1001)).await);
        drop(subscriber);

        let mut recorder = Recorder { updates: vec![] };
        timeout(Duration::from_secs(1), events.feed(&mut recorder)).await
            .expect("stream did not end");

        let nr_clients: Vec<&Update> = recorder.updates.iter()
            .filter(|update| matches!(update, Update::NrClients(_)))
            .collect();
        assert_eq!(vec![&Update::NrClients(1), &Update::NrClients(2)], nr_clients);
        assert_eq!(4, recorder.updates.len());
        assert!(recorder.updates.contains(&Update::ServerStatus(ServerStatus::Starting)));
        assert!(recorder.updates.contains(&Update::CarPurged(1001)));
    }

    #[async_std::test]
    async fn notify_fails_once_subscriber_is_gone() {
        let (subscriber, events) = subscription();
        drop(events);
        assert!(!subscriber.notify(&Update::NrClients(1)).await);
    }

    #[async_std::test]
    async fn flush_ends_when_all_channels_close() {
        let (subscriber, events) = subscription();
        assert!(subscriber.notify(&Update::CarPurged(7)).await);
        drop(subscriber);

        timeout(Duration::from_secs(1), events.flush()).await
            .expect("flush did not end");
    }
}
