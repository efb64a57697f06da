use std::fmt;

use anyhow::{Context, Result};
use clearml::Settings;
use serde::Deserialize;

/// Platform connection settings, read from `CLEARML_*` environment variables.
#[derive(Deserialize, Clone)]
pub struct EnvVars {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_files_host")]
    pub files_host: String,
    #[serde(default)]
    pub api_access_key: String,
    #[serde(default)]
    pub api_secret_key: String,
}

fn default_api_host() -> String {
    String::from("http://localhost:8008")
}

fn default_files_host() -> String {
    String::from("http://localhost:8081")
}

fn strip_slash(value: &str) -> String {
    value.trim_end_matches('/').to_owned()
}

impl EnvVars {
    pub fn from_env() -> Result<Self> {
        envy::prefixed("CLEARML_")
            .from_env::<EnvVars>()
            .context("invalid CLEARML_* environment")
    }

    pub fn settings(&self) -> Settings {
        Settings {
            api_host: strip_slash(&self.api_host),
            files_host: strip_slash(&self.files_host),
            access_key: self.api_access_key.clone(),
            secret_key: self.api_secret_key.clone(),
        }
    }
}

// Hand-written so the secret key never ends up in the logs.
impl fmt::Debug for EnvVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvVars")
            .field("api_host", &self.api_host)
            .field("files_host", &self.files_host)
            .field("api_access_key", &self.api_access_key)
            .field("api_secret_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::EnvVars;

    fn parse(vars: &[(&str, &str)]) -> EnvVars {
        envy::prefixed("CLEARML_")
            .from_iter::<_, EnvVars>(
                vars.iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned())),
            )
            .unwrap()
    }

    #[test]
    pub fn defaults() {
        let env = parse(&[]);
        assert_eq!(env.api_host, "http://localhost:8008");
        assert_eq!(env.files_host, "http://localhost:8081");
        assert_eq!(env.api_access_key, "");
    }

    #[test]
    pub fn settings_strip_trailing_slash() {
        let env = parse(&[
            ("CLEARML_API_HOST", "http://10.0.0.5:8008/"),
            ("CLEARML_FILES_HOST", "http://10.0.0.5:8081//"),
            ("CLEARML_API_ACCESS_KEY", "ACCESS"),
            ("CLEARML_API_SECRET_KEY", "SECRET"),
        ]);
        let settings = env.settings();
        assert_eq!(settings.api_host, "http://10.0.0.5:8008");
        assert_eq!(settings.files_host, "http://10.0.0.5:8081");
        assert_eq!(settings.access_key, "ACCESS");
        assert_eq!(settings.secret_key, "SECRET");
    }

    #[test]
    pub fn debug_redacts_secret() {
        let env = parse(&[("CLEARML_API_SECRET_KEY", "hunter2")]);
        let printed = format!("{:?}", env);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
