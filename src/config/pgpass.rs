//! The pgpass password file.
//!
//! Colon-delimited lines of `host:port:db:user:password` with backslash
//! escapes, `*` wildcards on any field, and `#` comments. On POSIX the
//! file must be a regular file with no group/other permission bits, or
//! it is skipped with a warning.

use std::path::PathBuf;

use tracing::warn;

use crate::config::Env;

/// Looks up a password for the given connection coordinates.
///
/// The file comes from `PGPASSFILE` or `~/.pgpass`. Returns the password
/// of the first matching line, or `None` when no file, no match, or the
/// file fails the permission check.
pub fn lookup_pgpass(
    env: &dyn Env,
    host: &str,
    port: u16,
    dbname: &str,
    user: &str,
) -> Option<String> {
    let path = pgpass_path(env)?;
    if !permissions_ok(&path) {
        return None;
    }
    let contents = std::fs::read_to_string(&path).ok()?;

    // UNIX-socket connections match as "localhost", per libpq.
    let host = if host.is_empty() || host.starts_with('/') || host.starts_with('@') {
        "localhost"
    } else {
        host
    };
    let port = port.to_string();

    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(fields) = split_fields(line) else {
            warn!("skipping malformed pgpass line");
            continue;
        };
        let [f_host, f_port, f_db, f_user, password] = fields;
        if field_matches(&f_host, host)
            && field_matches(&f_port, &port)
            && field_matches(&f_db, dbname)
            && field_matches(&f_user, user)
        {
            return Some(password);
        }
    }
    None
}

fn pgpass_path(env: &dyn Env) -> Option<PathBuf> {
    if let Some(path) = env.var("PGPASSFILE") {
        return Some(PathBuf::from(path));
    }
    env.home_dir().map(|home| home.join(".pgpass"))
}

#[cfg(unix)]
fn permissions_ok(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        warn!(path = %path.display(), "pgpass is not a regular file; ignoring");
        return false;
    }
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        warn!(
            path = %path.display(),
            "pgpass has group or world access (mode {:o}); ignoring (chmod 0600 to use it)",
            mode & 0o777
        );
        return false;
    }
    true
}

#[cfg(not(unix))]
fn permissions_ok(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Splits one pgpass line into its five fields, honoring `\:` and `\\`
/// escapes. Returns `None` when the line does not have exactly five.
fn split_fields(line: &str) -> Option<[String; 5]> {
    let mut fields = Vec::with_capacity(5);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields.try_into().ok()
}

fn field_matches(field: &str, value: &str) -> bool {
    field == "*" || field == value
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::test_env::StubEnv;

    fn write_pgpass(contents: &str, mode: u32) -> (StubEnv, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = mode;
        let env = StubEnv::with(&[("PGPASSFILE", file.path().to_str().unwrap())]);
        (env, file)
    }

    #[test]
    fn exact_match_returns_password() {
        let (env, _file) = write_pgpass("db.example.com:5432:orders:alice:sekrit\n", 0o600);
        assert_eq!(
            lookup_pgpass(&env, "db.example.com", 5432, "orders", "alice"),
            Some("sekrit".to_string())
        );
    }

    #[test]
    fn wildcards_match_any_field() {
        let (env, _file) = write_pgpass("*:*:*:alice:fallback\n", 0o600);
        assert_eq!(
            lookup_pgpass(&env, "anywhere", 9999, "anything", "alice"),
            Some("fallback".to_string())
        );
        assert_eq!(lookup_pgpass(&env, "anywhere", 9999, "anything", "bob"), None);
    }

    #[test]
    fn first_match_wins() {
        let (env, _file) = write_pgpass(
            "# a comment\nh:5432:db:u:first\n*:*:*:*:second\n",
            0o600,
        );
        assert_eq!(
            lookup_pgpass(&env, "h", 5432, "db", "u"),
            Some("first".to_string())
        );
        assert_eq!(
            lookup_pgpass(&env, "other", 5432, "db", "u"),
            Some("second".to_string())
        );
    }

    #[test]
    fn escapes_in_fields_and_password() {
        let (env, _file) = write_pgpass(r"h\:1:5432:db:u:pa\:ss\\word" , 0o600);
        assert_eq!(
            lookup_pgpass(&env, "h:1", 5432, "db", "u"),
            Some(r"pa:ss\word".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn group_readable_file_is_skipped() {
        let (env, _file) = write_pgpass("*:*:*:*:leaked\n", 0o644);
        assert_eq!(lookup_pgpass(&env, "h", 5432, "db", "u"), None);
    }

    #[test]
    fn empty_host_matches_localhost() {
        let (env, _file) = write_pgpass("localhost:*:*:*:local\n", 0o600);
        assert_eq!(
            lookup_pgpass(&env, "", 5432, "db", "u"),
            Some("local".to_string())
        );
        assert_eq!(
            lookup_pgpass(&env, "/var/run/postgresql", 5432, "db", "u"),
            Some("local".to_string())
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (env, _file) = write_pgpass("not-enough-fields\n*:*:*:*:ok\n", 0o600);
        assert_eq!(lookup_pgpass(&env, "h", 5432, "db", "u"), Some("ok".to_string()));
    }
}
