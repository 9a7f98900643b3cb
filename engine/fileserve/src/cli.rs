//! Command line surface of the file-serve subsystem

/// Parsed `-fs_*` arguments. Unrecognized arguments are left alone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileserveCliArgs {
    /// -fs_off: disable fileserve entirely
    pub off: bool,
    /// -fs_server host:port
    pub server: Option<String>,
    /// -fs_port N
    pub port: Option<u16>,
    /// -fs_start: start serving on launch
    pub start: bool,
    /// -fs_timeout seconds
    pub timeout_secs: Option<f32>,
}

impl FileserveCliArgs {
    pub fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();
        let mut iter = args.iter().peekable();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-fs_off" => parsed.off = true,
                "-fs_start" => parsed.start = true,
                "-fs_server" => {
                    parsed.server = iter.next().cloned();
                }
                "-fs_port" => {
                    parsed.port = iter.next().and_then(|p| p.parse().ok());
                }
                "-fs_timeout" => {
                    parsed.timeout_secs = iter.next().and_then(|t| t.parse().ok());
                }
                _ => {}
            }
        }

        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parses_the_full_surface() {
        let parsed = FileserveCliArgs::parse(&args(&[
            "game",
            "-fs_server",
            "10.0.0.2:1042",
            "-fs_port",
            "2043",
            "-fs_start",
            "-fs_timeout",
            "2.5",
        ]));

        assert_eq!(
            parsed,
            FileserveCliArgs {
                off: false,
                server: Some("10.0.0.2:1042".to_owned()),
                port: Some(2043),
                start: true,
                timeout_secs: Some(2.5),
            }
        );
    }

    #[test]
    fn off_flag_and_garbage_values() {
        let parsed = FileserveCliArgs::parse(&args(&["-fs_off", "-fs_port", "not-a-port"]));
        assert!(parsed.off);
        assert_eq!(parsed.port, None);
    }
}
