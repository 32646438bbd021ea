use std::convert::TryFrom;
use std::env;
use std::fs;
use std::io;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use yaml_rust::{ ScanError, Yaml, YamlLoader };

pub const DEFAULT_CONFIGURATION_FILE: &str = "configuration.yaml";

const SERVER_EXECUTABLE: &str = "accServer.exe";
const DEFAULT_WRAPPER: &str = "wine";
const DEFAULT_NEW_RESULTS_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] ScanError),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("setting `{key}` {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

/// Settings for managing the accServer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub installation_dir: PathBuf,
    /// Results directory if not the one inside the installation
    pub results_dir: Option<PathBuf>,
    /// How long to wait before a new result file is picked up
    pub new_results_delay: Duration,
    /// Command to run the server executable with
    pub exe_wrapper: Option<String>,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Configuration::try_from(contents.as_str())
    }

    pub fn executable(&self) -> PathBuf {
        self.installation_dir.join(SERVER_EXECUTABLE)
    }

    pub fn resolve_results_dir(&self) -> PathBuf {
        match &self.results_dir {
            Some(results_dir) => results_dir.clone(),
            None => self.installation_dir.join("results"),
        }
    }

    /// The configured wrapper, or wine when it is installed and nothing is configured
    pub fn exe_wrapper(&self) -> Option<String> {
        self.exe_wrapper.clone()
            .or_else(|| find_on_path(DEFAULT_WRAPPER).map(|path| path.display().to_string()))
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn optional_string(yaml: &Yaml, key: &'static str) -> Result<Option<String>, ConfigError> {
    match yaml {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::String(value) if value.is_empty() => Ok(None),
        Yaml::String(value) => Ok(Some(value.clone())),
        _ => Err(ConfigError::Invalid { key, reason: "must be a string" }),
    }
}

impl TryFrom<&str> for Configuration {
    type Error = ConfigError;

    fn try_from(str: &str) -> Result<Self, Self::Error> {
        let documents = YamlLoader::load_from_str(str)?;
        let server = match documents.first() {
            Some(document) => &document["server"],
            None => return Err(ConfigError::Missing("server")),
        };

        let installation_dir = optional_string(&server["installation_dir"], "server.installation_dir")?
            .ok_or(ConfigError::Missing("server.installation_dir"))?;
        let results_dir = optional_string(&server["results_dir"], "server.results_dir")?;
        let exe_wrapper = optional_string(&server["exe_wrapper"], "server.exe_wrapper")?;

        let new_results_delay = match &server["new_results_delay"] {
            Yaml::BadValue | Yaml::Null => DEFAULT_NEW_RESULTS_DELAY,
            Yaml::Integer(seconds) => u64::try_from(*seconds)
                .map(Duration::from_secs)
                .map_err(|_err| ConfigError::Invalid { key: "server.new_results_delay", reason: "must not be negative" })?,
            _ => return Err(ConfigError::Invalid { key: "server.new_results_delay", reason: "must be a number of seconds" }),
        };

        Ok(Configuration {
            installation_dir: PathBuf::from(installation_dir),
            results_dir: results_dir.map(PathBuf::from),
            new_results_delay,
            exe_wrapper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_configuration() {
        let config = Configuration::try_from("
server:
  installation_dir: /opt/accserver
  results_dir: /var/lib/acc/results
  new_results_delay: 10
  exe_wrapper: /usr/bin/wine64
").unwrap();

        assert_eq!(Configuration {
            installation_dir: PathBuf::from("/opt/accserver"),
            results_dir: Some(PathBuf::from("/var/lib/acc/results")),
            new_results_delay: Duration::from_secs(10),
            exe_wrapper: Some("/usr/bin/wine64".to_string()),
        }, config);
        assert_eq!(PathBuf::from("/opt/accserver/accServer.exe"), config.executable());
        assert_eq!(PathBuf::from("/var/lib/acc/results"), config.resolve_results_dir());
        assert_eq!(Some("/usr/bin/wine64".to_string()), config.exe_wrapper());
    }

    #[test]
    fn minimal_configuration() {
        let config = Configuration::try_from("server:\n  installation_dir: /opt/accserver\n").unwrap();

        assert_eq!(None, config.results_dir);
        assert_eq!(None, config.exe_wrapper);
        assert_eq!(DEFAULT_NEW_RESULTS_DELAY, config.new_results_delay);
        assert_eq!(PathBuf::from("/opt/accserver/results"), config.resolve_results_dir());
    }

    #[test]
    fn empty_wrapper_is_no_wrapper() {
        let config = Configuration::try_from("server:\n  installation_dir: /opt/accserver\n  exe_wrapper: \"\"\n").unwrap();
        assert_eq!(None, config.exe_wrapper);
    }

    #[test]
    fn installation_dir_is_required() {
        let result = Configuration::try_from("server:\n  results_dir: /tmp\n");
        assert!(matches!(result, Err(ConfigError::Missing("server.installation_dir"))));

        let result = Configuration::try_from("");
        assert!(matches!(result, Err(ConfigError::Missing("server"))));
    }

    #[test]
    fn invalid_values() {
        let result = Configuration::try_from("server:\n  installation_dir: [a, b]\n");
        assert!(matches!(result, Err(ConfigError::Invalid { key: "server.installation_dir", .. })));

        let result = Configuration::try_from("server:\n  installation_dir: /opt\n  new_results_delay: -1\n");
        assert!(matches!(result, Err(ConfigError::Invalid { key: "server.new_results_delay", .. })));

        let result = Configuration::try_from("server:\n  installation_dir: /opt\n  new_results_delay: soon\n");
        assert!(matches!(result, Err(ConfigError::Invalid { key: "server.new_results_delay", .. })));
    }

    #[test]
    fn broken_yaml() {
        let result = Configuration::try_from("server: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIGURATION_FILE);
        fs::write(&path, "server:\n  installation_dir: /srv/acc\n").unwrap();

        let config = Configuration::load(&path).unwrap();
        assert_eq!(PathBuf::from("/srv/acc/accServer.exe"), config.executable());

        let missing = Configuration::load(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
