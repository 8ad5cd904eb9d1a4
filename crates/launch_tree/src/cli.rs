//! Command-line interface for launch_tree

use argh::FromArgs;
use indexmap::IndexMap;

/// Hierarchical launch-description orchestrator
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the root launch file (default: launch/default.launch.yaml)
    #[argh(positional, default = "String::from(\"launch/default.launch.yaml\")")]
    pub launch_file: String,

    /// override launch arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// print the dry-run plan as JSON
    #[argh(switch)]
    pub json: bool,

    /// validate the root launch file and exit
    #[argh(switch)]
    pub validate: bool,

    /// list the arguments declared by the root launch file and exit
    #[argh(switch)]
    pub show_args: bool,

    /// grace period before killing processes at shutdown, in milliseconds
    #[argh(option, default = "5000")]
    pub shutdown_timeout_ms: u64,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, ":=").collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!(
            "Invalid argument format '{}'. Expected 'key:=value'",
            s
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl LaunchArgs {
    /// Argument overrides in command-line order; a repeated key keeps the last value
    pub fn arg_overrides(&self) -> IndexMap<String, String> {
        self.arg.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_override() {
        let result = parse_arg_override("config:=my_config.yaml");
        assert_eq!(result, Ok(("config".to_string(), "my_config.yaml".to_string())));
    }

    #[test]
    fn test_parse_arg_override_with_equals() {
        let result = parse_arg_override("url:=http://localhost:8080");
        assert_eq!(result, Ok(("url".to_string(), "http://localhost:8080".to_string())));
    }

    #[test]
    fn test_parse_arg_override_invalid() {
        assert!(parse_arg_override("invalid").is_err());
        assert!(parse_arg_override(":=value").is_err());
    }

    #[test]
    fn test_from_args() {
        let args = LaunchArgs::from_args(
            &["launch_tree"],
            &["root.launch.yaml", "-a", "ns:=robot1", "-a", "rate:=10", "--dry-run"],
        )
        .unwrap();
        assert_eq!(args.launch_file, "root.launch.yaml");
        assert!(args.dry_run);
        assert_eq!(args.arg_overrides().get("ns").map(String::as_str), Some("robot1"));
        assert_eq!(args.shutdown_timeout_ms, 5000);
    }
}
