//! Shared helpers: logging setup, time conversion, path handling.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::aofs_lib::types::{FsError, FsResult};

pub fn init_logs() {
    let _ = env_logger::builder().format_timestamp_millis().try_init();
}

/// Convert epoch seconds to the `SystemTime` FUSE attrs carry.
pub fn utc_time(secs: i64) -> SystemTime {
    NaiveDateTime::from_timestamp_opt(secs, 0)
        .map(|naive| SystemTime::from(DateTime::<Utc>::from_utc(naive, Utc)))
        .unwrap_or(UNIX_EPOCH)
}

/// Seconds since the epoch, the resolution the log stores.
pub fn now_secs() -> i64 {
    system_time_secs(SystemTime::now())
}

pub fn system_time_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Canonical engine path: leading `/`, no trailing `/` except root.
pub fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Parent of a canonical path; `None` for root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Join a canonical directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// The name under `dir` if `path` is an immediate child of it.
pub fn child_name<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let rest = if dir == "/" {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Convert an engine result into the errno form FUSE `init` expects.
pub fn ret<T>(res: FsResult<T>) -> Result<T, libc::c_int> {
    res.map_err(|e| {
        log::error!("{}", e);
        e.errno()
    })
}

pub fn invalid_name(e: &std::ffi::OsStr) -> FsError {
    log::debug!("rejecting non-utf8 name {:?}", e);
    FsError::Invalid("non-utf8 name")
}

/// Log an operation entry with its arguments.
#[macro_export]
macro_rules! prv {
    ($op:expr) => {
        log::debug!("#{}", $op)
    };
    ($op:expr, $($e:expr),+) => {
        log::debug!("#{} {}", $op,
            vec![$(format!("{}={:?}", stringify!($e), $e)),+].join(" "))
    };
}

/// Reply-or-return for FUSE callbacks: bind an Ok value or send errno back.
#[macro_export]
macro_rules! rep {
    ($reply:expr, $res:expr) => {
        match $res {
            Ok(v) => v,
            Err(e) => {
                log::debug!("reply error: {}", e);
                $reply.error(e.errno());
                return;
            }
        }
    };
    ($reply:expr, $name:ident, $res:expr) => {
        let $name = match $res {
            Ok(v) => v,
            Err(e) => {
                log::debug!("reply error: {}", e);
                $reply.error(e.errno());
                return;
            }
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalisation() {
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("/a/b/"), "/a/b");
        assert_eq!(canonical_path("a/b"), "/a/b");
        assert_eq!(canonical_path("///"), "/");
    }

    #[test]
    fn parents() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn child_names() {
        assert_eq!(child_name("/", "/a"), Some("a"));
        assert_eq!(child_name("/", "/a/b"), None);
        assert_eq!(child_name("/a", "/a/b"), Some("b"));
        assert_eq!(child_name("/a", "/a/b/c"), None);
        assert_eq!(child_name("/a", "/ab"), None);
        assert_eq!(child_name("/a", "/a"), None);
    }

    #[test]
    fn join() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn time_conversion() {
        assert_eq!(utc_time(0), UNIX_EPOCH);
        let t = utc_time(1_000_000);
        assert_eq!(system_time_secs(t), 1_000_000);
    }
}
