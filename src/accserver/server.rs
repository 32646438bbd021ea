use std::sync::Arc;

use async_std::channel::Receiver;
use async_std::sync::Mutex;

use crate::accdata::ReferenceData;
use crate::accserver::instance::{ Instance, InstanceState, StartupError, StopError };
use crate::accserver::live_state::LiveStateEngine;
use crate::accserver::log_parser::LogParser;
use crate::accserver::server_log::LogLine;
use crate::config::Configuration;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Stop(#[from] StopError),
}

/// An accServer installation together with the live state of its current instance
pub struct AccServer {
    config: Configuration,
    instance: Mutex<Option<Instance>>,
    live_state: LiveStateEngine,
}

impl AccServer {
    pub fn new(config: Configuration, reference: Arc<ReferenceData>) -> AccServer {
        AccServer {
            config,
            instance: Mutex::new(None),
            live_state: LiveStateEngine::new(reference),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Starts a new server instance and follows its log in the live state
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut current = self.instance.lock().await;
        if InstanceState::of(current.as_ref()) != InstanceState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }

        let exe_wrapper = self.config.exe_wrapper();
        let instance = Instance::start(&self.config.executable(), exe_wrapper.as_deref())?;
        info!("Started accServer with pid {}", instance.pid());

        let parser = LogParser::spawn(instance.new_log_channel());
        self.live_state.new_instance(parser.events()).await;

        *current = Some(instance);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ServerError> {
        match self.instance.lock().await.as_ref() {
            Some(instance) => instance.stop().map_err(ServerError::Stop),
            None => Err(ServerError::Stop(StopError::AlreadyStopped)),
        }
    }

    pub async fn state(&self) -> InstanceState {
        InstanceState::of(self.instance.lock().await.as_ref())
    }

    /// A new consumer of the complete log of the current instance, if any was started
    pub async fn attach_log(&self) -> Option<Receiver<LogLine>> {
        self.instance.lock().await.as_ref().map(Instance::new_log_channel)
    }

    pub fn live_state(&self) -> &LiveStateEngine {
        &self.live_state
    }

    /// Waits until the current instance, if any, has exited
    pub async fn wait(&self) {
        let instance = self.instance.lock().await.clone();
        if let Some(instance) = instance {
            instance.wait().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use async_std::future::timeout;

    use crate::accserver::ServerStatus;

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
    async fn runs_server_and_follows_its_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = install(&dir, "echo 'Server starting with version 255'\necho 'RegisterToLobby succeeded'\necho '3 client(s) online'\nexec sleep 30\n");
        let server = AccServer::new(config, Arc::new(ReferenceData::builtin()));
        let events = server.live_state().attach().await;

        assert!(server.attach_log().await.is_none());
        server.start().await.unwrap();
        assert_eq!(InstanceState::Running, server.state().await);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        let recv_status = || async {
            timeout(Duration::from_secs(5), events.server_status.recv()).await.unwrap().unwrap()
        };
        assert_eq!(ServerStatus::Starting, recv_status().await);
        assert_eq!(ServerStatus::NotRegistered, recv_status().await);
        assert_eq!(ServerStatus::Online, recv_status().await);

        let log = server.attach_log().await.unwrap();
        let first = timeout(Duration::from_secs(5), log.recv()).await.unwrap().unwrap();
        assert_eq!("Server starting with version 255", first.text);

        server.stop().await.unwrap();
        timeout(Duration::from_secs(5), server.wait()).await.expect("server did not stop");
        assert_eq!(InstanceState::Stopped, server.state().await);
        assert_eq!(ServerStatus::Offline, recv_status().await);
        assert_eq!(3, server.live_state().snapshot().await.nr_clients);
        assert!(matches!(server.stop().await, Err(ServerError::Stop(StopError::AlreadyStopped))));
    }

    #[async_std::test]
    async fn stop_without_instance_fails() {
        let config = Configuration {
            installation_dir: PathBuf::from("/nonexistent"),
            results_dir: None,
            new_results_delay: Duration::from_secs(0),
            exe_wrapper: None,
        };
        let server = AccServer::new(config, Arc::new(ReferenceData::builtin()));

        assert_eq!(InstanceState::Stopped, server.state().await);
        assert!(matches!(server.stop().await, Err(ServerError::Stop(StopError::AlreadyStopped))));
        assert!(matches!(server.start().await, Err(ServerError::Startup(StartupError::ExecutableNotFound(_)))));
        timeout(Duration::from_secs(1), server.wait()).await.expect("wait without instance blocked");
    }
}
