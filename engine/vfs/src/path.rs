use std::collections::HashMap;
use std::path::PathBuf;

use common::*;

/// How a path addresses the file system
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VirtualPath<'a> {
    /// `:root/some/file` targets the mount registered with that root name
    Rooted { root: &'a str, rest: &'a str },
    /// `>special/some/file` goes through the special directory table
    Special { name: &'a str, rest: &'a str },
    /// Bypasses virtual resolution entirely
    Absolute(&'a str),
    /// Probes all mounts in reverse registration order
    Relative(&'a str),
}

impl<'a> VirtualPath<'a> {
    pub fn parse(path: &'a str) -> VirtualPath<'a> {
        if let Some(stripped) = path.strip_prefix(':') {
            let (root, rest) = stripped.split_once('/').unwrap_or((stripped, ""));
            return VirtualPath::Rooted { root, rest };
        }

        if let Some(stripped) = path.strip_prefix('>') {
            let (name, rest) = stripped.split_once('/').unwrap_or((stripped, ""));
            return VirtualPath::Special { name, rest };
        }

        if is_absolute(path) {
            VirtualPath::Absolute(path)
        } else {
            VirtualPath::Relative(path)
        }
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.chars().nth(1) == Some(':')
}

/// Normalizes separators, collapses `.`/`..` and duplicate slashes. `..` never
/// climbs above the start of the path
pub fn make_clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');

    for part in path.split(|c| c == '/' || c == '\\') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let mut clean = String::with_capacity(path.len());
    if absolute {
        clean.push('/');
    }
    clean.push_str(&parts.join("/"));
    clean
}

/// True when the string is shaped like an asset GUID and should go through
/// mount redirection tables
pub fn is_asset_guid(path: &str) -> bool {
    uuid::Uuid::try_parse(path.trim_start_matches('{').trim_end_matches('}')).is_ok()
}

lazy_static! {
    static ref SPECIAL_DIRS: parking_lot::RwLock<HashMap<String, PathBuf>> = {
        let mut dirs = HashMap::new();

        let appdir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.to_owned()))
            .unwrap_or_else(|| PathBuf::from("."));

        dirs.insert("appdir".to_owned(), appdir.clone());
        dirs.insert("sdk".to_owned(), appdir);

        if let Some(user) = user_data_dir() {
            dirs.insert("user".to_owned(), user);
        }

        parking_lot::RwLock::new(dirs)
    };
}

fn user_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
    }
}

pub fn register_special_directory(name: &str, path: impl Into<PathBuf>) {
    let path = path.into();
    debug!("registered special directory"; "name" => name, "path" => %path.display());
    SPECIAL_DIRS.write().insert(name.to_owned(), path);
}

/// Consumes `-specialdirs name1 path1 name2 path2 …` from the command line
pub fn register_special_dirs_from_args(args: &[String]) {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-specialdirs" {
            while let (Some(name), Some(path)) = (iter.next(), iter.next()) {
                if name.starts_with('-') {
                    break;
                }
                register_special_directory(name, path.as_str());
            }
        }
    }
}

/// Resolves `>name/rest` (or a bare `name`) to an absolute path
pub fn resolve_special_directory(path: &str) -> crate::VfsResult<PathBuf> {
    let stripped = path.strip_prefix('>').unwrap_or(path);
    let (name, rest) = stripped.split_once('/').unwrap_or((stripped, ""));

    let dirs = SPECIAL_DIRS.read();
    let base = dirs
        .get(name)
        .ok_or_else(|| crate::VfsError::UnknownSpecialDirectory(name.to_owned()))?;

    if rest.is_empty() {
        Ok(base.clone())
    } else {
        Ok(base.join(make_clean_path(rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_addressing_forms() {
        assert_eq!(
            VirtualPath::parse(":data/textures/rock.dds"),
            VirtualPath::Rooted {
                root: "data",
                rest: "textures/rock.dds"
            }
        );
        assert_eq!(
            VirtualPath::parse(">user/settings.ron"),
            VirtualPath::Special {
                name: "user",
                rest: "settings.ron"
            }
        );
        assert_eq!(
            VirtualPath::parse("/tmp/x"),
            VirtualPath::Absolute("/tmp/x")
        );
        assert_eq!(
            VirtualPath::parse("textures/rock.dds"),
            VirtualPath::Relative("textures/rock.dds")
        );
    }

    #[test]
    fn clean_path_collapses() {
        assert_eq!(make_clean_path("a//b/./c"), "a/b/c");
        assert_eq!(make_clean_path("a/b/../c"), "a/c");
        assert_eq!(make_clean_path("a\\b\\c"), "a/b/c");
        assert_eq!(make_clean_path("/a/../../b"), "/b");
        assert_eq!(make_clean_path("../x"), "../x");
    }

    #[test]
    fn guid_detection() {
        assert!(is_asset_guid("01234567-89ab-cdef-0123-456789abcdef"));
        assert!(is_asset_guid("{01234567-89ab-cdef-0123-456789abcdef}"));
        assert!(!is_asset_guid("textures/rock.dds"));
    }

    #[test]
    fn special_dirs_resolve() {
        common::logging::for_tests();
        register_special_directory("testdata", "/tmp/engine-testdata");
        let resolved = resolve_special_directory(">testdata/sub/file.bin").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/engine-testdata/sub/file.bin"));

        assert!(resolve_special_directory(">nope/x").is_err());
    }

    #[test]
    fn specialdirs_cli() {
        common::logging::for_tests();
        let args: Vec<String> = ["-specialdirs", "alpha", "/tmp/a", "beta", "/tmp/b"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        register_special_dirs_from_args(&args);

        assert_eq!(
            resolve_special_directory("alpha").unwrap(),
            PathBuf::from("/tmp/a")
        );
        assert_eq!(
            resolve_special_directory("beta").unwrap(),
            PathBuf::from("/tmp/b")
        );
    }
}
