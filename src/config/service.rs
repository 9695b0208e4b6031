//! libpq-compatible connection service files.
//!
//! A service file is a plain INI file mapping a service name to connection
//! parameters:
//!
//! ```ini
//! # comment
//! [prod]
//! host=db.internal
//! port=5433
//! dbname=ledger
//! ```

use std::path::PathBuf;

use crate::config::Env;
use crate::error::{Error, Result};

/// Returns the key/value pairs of the named service section.
///
/// File lookup order: `PGSERVICEFILE`, `PGSYSCONFDIR/pg_service.conf`,
/// `~/.pg_service.conf`, `/etc/pg_service.conf`. A `hostaddr` entry is
/// moved to the end of the returned list so that it overrides `host`
/// when applied in order.
pub fn service_params(name: &str, env: &dyn Env) -> Result<Vec<(String, String)>> {
    let path = service_file_path(env)
        .ok_or_else(|| Error::Config(format!("no service file found for service '{name}'")))?;
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("cannot read service file {}: {e}", path.display()))
    })?;

    let mut params = parse_section(&contents, name)
        .ok_or_else(|| Error::Config(format!("service '{name}' not found in {}", path.display())))?;

    // hostaddr overrides host; applying it last makes that true for
    // callers that fold the list in order.
    params.sort_by_key(|(k, _)| k == "hostaddr");
    Ok(params)
}

fn service_file_path(env: &dyn Env) -> Option<PathBuf> {
    if let Some(path) = env.var("PGSERVICEFILE") {
        return Some(PathBuf::from(path));
    }
    let mut candidates = Vec::new();
    if let Some(sysconfdir) = env.var("PGSYSCONFDIR") {
        candidates.push(PathBuf::from(sysconfdir).join("pg_service.conf"));
    }
    if let Some(home) = env.home_dir() {
        candidates.push(home.join(".pg_service.conf"));
    }
    candidates.push(PathBuf::from("/etc/pg_service.conf"));
    candidates.into_iter().find(|p| p.is_file())
}

fn parse_section(contents: &str, name: &str) -> Option<Vec<(String, String)>> {
    let mut in_section = false;
    let mut found = false;
    let mut params = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = section.trim() == name;
            found |= in_section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            params.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    found.then_some(params)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::test_env::StubEnv;

    const FILE: &str = "\
# global comment
[prod]
host=db.internal
port=5433
dbname=ledger
user=svc

[standby]
host=ignored.example.com
hostaddr=10.0.0.7
port=5433
";

    fn env_with_file(contents: &str) -> (StubEnv, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let env = StubEnv::with(&[("PGSERVICEFILE", file.path().to_str().unwrap())]);
        (env, file)
    }

    #[test]
    fn reads_named_section() {
        let (env, _file) = env_with_file(FILE);
        let params = service_params("prod", &env).unwrap();
        assert!(params.contains(&("host".to_string(), "db.internal".to_string())));
        assert!(params.contains(&("dbname".to_string(), "ledger".to_string())));
    }

    #[test]
    fn hostaddr_sorts_after_host() {
        let (env, _file) = env_with_file(FILE);
        let params = service_params("standby", &env).unwrap();
        let host_idx = params.iter().position(|(k, _)| k == "host").unwrap();
        let addr_idx = params.iter().position(|(k, _)| k == "hostaddr").unwrap();
        assert!(addr_idx > host_idx);
        assert_eq!(params.last().unwrap().1, "10.0.0.7");
    }

    #[test]
    fn missing_service_is_config_error() {
        let (env, _file) = env_with_file(FILE);
        assert!(matches!(
            service_params("nonexistent", &env),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_config_error() {
        let env = StubEnv::with(&[("PGSERVICEFILE", "/nonexistent/pg_service.conf")]);
        assert!(matches!(service_params("prod", &env), Err(Error::Config(_))));
    }

    #[test]
    fn hostaddr_overrides_host_in_config() {
        let (env, _file) = env_with_file(FILE);
        let config = crate::config::Config::from_service("standby", &env).unwrap();
        assert_eq!(config.host, "10.0.0.7");
    }

    #[test]
    fn pgservice_env_selects_section() {
        let (mut env, _file) = env_with_file(FILE);
        env.vars.insert("PGSERVICE".to_string(), "prod".to_string());

        let config = crate::config::Config::from_env_service(&env).unwrap().unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.dbname, "ledger");

        let none = StubEnv::with(&[]);
        assert!(crate::config::Config::from_env_service(&none).unwrap().is_none());
    }
}
