#[macro_use] extern crate log;
extern crate env_logger;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::task;
use async_trait::async_trait;

use acc_live::accdata::ReferenceData;
use acc_live::accserver::ServerStatus;
use acc_live::accserver::live_events::{ StateTracker, Update };
use acc_live::accserver::server::AccServer;
use acc_live::config::{ self, Configuration };

/// Logs every change of the live state
struct Dashboard {
    offline: Sender<()>,
}

#[async_trait]
impl StateTracker for Dashboard {
    async fn process(&mut self, update: &Update) {
        match update {
            Update::ServerStatus(status) => {
                info!["Server is {}", status];
                if *status == ServerStatus::Offline && self.offline.try_send(()).is_err() {
                    debug!["Nobody waits for the server to go offline"];
                }
            },
            Update::NrClients(nr_clients) => info!["{} client(s) online", nr_clients],
            Update::Track(track) => info!["Track: {}", track.name],
            Update::SessionState(session) => info!["Session: {:?} ({:?})", session.session_type, session.phase],
            Update::CarState(car) => {
                let driver = car.current_driver.as_ref().map_or("-", |driver| driver.name.as_str());
                info!["P{} #{} {} laps: {}, best: {} ms, last: {} ms",
                    car.position, car.race_number, driver, car.laps_completed, car.best_lap_ms, car.last_lap_ms];
            },
            Update::CarPurged(car_id) => info!["Car {} left", car_id],
        }
    }
}

async fn run(config: Configuration, interrupted: Receiver<()>) -> i32 {
    let server = Arc::new(AccServer::new(config, Arc::new(ReferenceData::builtin())));

    let (offline_sender, offline) = channel::unbounded();
    let events = server.live_state().attach().await;
    let dashboard = task::spawn(async move {
        events.feed(&mut Dashboard { offline: offline_sender }).await
    });

    if let Err(err) = server.start().await {
        error!["Failed to start the server: {}", err];
        server.live_state().shutdown().await;
        dashboard.await;
        return 1;
    }

    let stopper = server.clone();
    task::spawn(async move {
        while interrupted.recv().await.is_ok() {
            info!["Stopping the server..."];
            if let Err(err) = stopper.stop().await {
                warn!["Unable to stop the server: {}", err];
            }
        }
    });

    server.wait().await;
    info!["The accServer process is {:?}", server.state().await];

    // The log may still be draining into the live state
    if offline.recv().await.is_err() {
        warn!["Live state ended without going offline"];
    }
    server.live_state().shutdown().await;
    dashboard.await;
    0
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let path = env::args().nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIGURATION_FILE));
    let config = match Configuration::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!["Invalid configuration {}: {}", path.display(), err];
            process::exit(2);
        },
    };
    info!["Using accServer installation in {}, results in {}",
        config.installation_dir.display(), config.resolve_results_dir().display()];

    let (interrupt, interrupted) = channel::bounded(1);
    let handler = ctrlc::set_handler(move || {
        if interrupt.try_send(()).is_err() {
            debug!["Stop already requested"];
        }
    });
    if let Err(err) = handler {
        warn!["Unable to handle Ctrl-C, the server is not stopped on interrupt: {}", err];
    }

    let exit_code = task::block_on(run(config, interrupted));
    process::exit(exit_code);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use async_std::future::timeout;

    fn install(dir: &tempfile::TempDir, script: &str) -> Configuration {
        fs::write(dir.path().join("accServer.exe"), script).unwrap();
        Configuration {
            installation_dir: dir.path().to_path_buf(),
            results_dir: None,
            new_results_delay: Duration::from_secs(0),
            exe_wrapper: Some("sh".to_string()),
        }
    }

    #[async_std::test]
    async fn dashboard_signals_offline_only() {
        let (offline_sender, offline) = channel::unbounded();
        let mut dashboard = Dashboard { offline: offline_sender };

        dashboard.process(&Update::ServerStatus(ServerStatus::Starting)).await;
        dashboard.process(&Update::NrClients(0)).await;
        assert!(offline.try_recv().is_err());

        dashboard.process(&Update::ServerStatus(ServerStatus::Offline)).await;
        assert!(offline.try_recv().is_ok());
    }

    #[async_std::test]
    async fn run_ends_after_short_lived_server_went_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = install(&dir, "echo 'Server starting with version 255'\n");
        let (_interrupt, interrupted) = channel::bounded(1);

        let exit_code = timeout(Duration::from_secs(5), run(config, interrupted)).await
            .expect("run did not end");
        assert_eq!(0, exit_code);
    }

    #[async_std::test]
    async fn interrupt_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = install(&dir, "echo started\nexec sleep 30\n");
        let (interrupt, interrupted) = channel::bounded(1);
        interrupt.send(()).await.unwrap();

        let exit_code = timeout(Duration::from_secs(5), run(config, interrupted)).await
            .expect("server was not stopped");
        assert_eq!(0, exit_code);
    }

    #[async_std::test]
    async fn missing_executable_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = install(&dir, "exit 0\n");
        config.installation_dir = dir.path().join("missing");
        let (_interrupt, interrupted) = channel::bounded(1);

        let exit_code = timeout(Duration::from_secs(5), run(config, interrupted)).await
            .expect("run did not end");
        assert_eq!(1, exit_code);
    }
}
