//! INI configuration loading: one plain struct per binary's needs,
//! populated by a thin pass over a parsed `ini::Ini`, with
//! `Error::Config` surfaced for anything missing or malformed.
use ini::Ini;

use crate::error::{Error, Result};
use crate::user::UserDirectory;

/// Minimum context-pool size; a smaller configured value is floored
/// here rather than honored literally.
pub const MIN_CONNECTIONS: usize = 64;
/// Default pool size when `connections` is absent from `[server]`.
pub const DEFAULT_CONNECTIONS: usize = 1024;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub users: UserDirectory,
}

pub struct LocalConfig {
    pub server_host: String,
    pub server_port: u16,
    pub client_host: String,
    pub client_port: u16,
    pub username: String,
    pub password: String,
}

fn load_ini(path: &str) -> Result<Ini> {
    Ini::load_from_file(path).map_err(|e| Error::Config(format!("{path}: {e}")))
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str> {
    ini.get_from(Some(section), key)
        .ok_or_else(|| Error::Config(format!("missing [{section}] {key}")))
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid port: {raw}")))
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let ini = load_ini(path)?;

        let host = get(&ini, "server", "host")?.to_string();
        let port = parse_port(get(&ini, "server", "port")?)?;
        let connections = match ini.get_from(Some("server"), "connections") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid connections: {raw}")))?
                .max(MIN_CONNECTIONS),
            None => DEFAULT_CONNECTIONS,
        };

        let mut users = UserDirectory::new();
        if let Some(section) = ini.section(Some("users")) {
            for (name, password) in section.iter() {
                if !users.add_user(name, password) {
                    return Err(Error::Config(format!("invalid user entry: {name}")));
                }
            }
        }
        if users.is_empty() {
            return Err(Error::Config("[users] section is empty".to_string()));
        }

        Ok(ServerConfig {
            host,
            port,
            connections,
            users,
        })
    }
}

impl LocalConfig {
    pub fn load(path: &str) -> Result<Self> {
        let ini = load_ini(path)?;

        Ok(LocalConfig {
            server_host: get(&ini, "server", "host")?.to_string(),
            server_port: parse_port(get(&ini, "server", "port")?)?,
            client_host: get(&ini, "client", "host")?.to_string(),
            client_port: parse_port(get(&ini, "client", "port")?)?,
            username: get(&ini, "user", "name")?.to_string(),
            password: get(&ini, "user", "password")?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_path::TempIniFile {
        tempfile_path::TempIniFile::new(contents)
    }

    // Minimal same-crate stand-in for a temp-file helper, to avoid a
    // `tempfile` dependency just for config tests: writes into the OS
    // temp dir under a process/thread-unique name and removes it on
    // drop.
    mod tempfile_path {
        use std::io::Write;
        use std::path::PathBuf;

        pub struct TempIniFile {
            path: PathBuf,
        }

        impl TempIniFile {
            pub fn new(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "fakio-test-{}-{}.ini",
                    std::process::id(),
                    contents.len()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                TempIniFile { path }
            }

            pub fn path(&self) -> &str {
                self.path.to_str().unwrap()
            }
        }

        impl Drop for TempIniFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn server_config_loads_users_and_defaults_connections() {
        let f = write_temp(
            "[server]\nhost = 0.0.0.0\nport = 8888\n\n[users]\nalice = hunter2\nbob = s3cret\n",
        );
        let cfg = ServerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8888);
        assert_eq!(cfg.connections, DEFAULT_CONNECTIONS);
        assert!(cfg.users.find_user("alice").is_some());
        assert!(cfg.users.find_user("bob").is_some());
    }

    #[test]
    fn server_config_floors_connections_at_minimum() {
        let f = write_temp(
            "[server]\nhost = 0.0.0.0\nport = 8888\nconnections = 4\n\n[users]\nalice = x\n",
        );
        let cfg = ServerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.connections, MIN_CONNECTIONS);
    }

    #[test]
    fn server_config_rejects_empty_users_section() {
        let f = write_temp("[server]\nhost = 0.0.0.0\nport = 8888\n");
        assert!(ServerConfig::load(f.path()).is_err());
    }

    #[test]
    fn local_config_loads_single_user() {
        let f = write_temp(
            "[server]\nhost = 1.2.3.4\nport = 8888\n\n[client]\nhost = 127.0.0.1\nport = 1080\n\n[user]\nname = alice\npassword = hunter2\n",
        );
        let cfg = LocalConfig::load(f.path()).unwrap();
        assert_eq!(cfg.username, "alice");
        assert_eq!(cfg.client_port, 1080);
    }
}
