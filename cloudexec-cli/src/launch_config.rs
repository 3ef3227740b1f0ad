//! Per-project launch configuration (`cloudexec.toml`)

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const LAUNCH_CONFIG_FILE: &str = "cloudexec.toml";

pub const TEMPLATE: &str = r#"
# Set the directory to upload to the droplet.
[input]
directory = ""
timeout = "48h"

[commands]
setup = '''
# Install dependencies here.
# This string is interpreted as a multi-line bash script

'''

# This command is run from the input directory
# after the setup script completes.
run = ""
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InputSection {
    pub directory: String,
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandsSection {
    pub setup: String,
    pub run: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub input: InputSection,
    pub commands: CommandsSection,
}

impl LaunchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read launch config file at {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("Failed to decode launch config file at {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Input directory, relative paths resolved against the config file's directory
    pub fn input_dir(&self, config_path: &Path) -> PathBuf {
        let dir = Path::new(&self.input.directory);
        if dir.is_absolute() {
            return dir.to_path_buf();
        }
        match config_path.parent() {
            Some(parent) => parent.join(dir),
            None => dir.to_path_buf(),
        }
    }
}

/// Write the template to `path`. Never overwrites an existing file.
pub fn write_template(path: &Path) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                anyhow::anyhow!("File {} already exists", path.display())
            }
            _ => anyhow::Error::new(e)
                .context(format!("Failed to create launch config file {}", path.display())),
        })?;
    file.write_all(TEMPLATE.as_bytes())
        .context("Failed to write launch config file")?;
    Ok(())
}

/// Reject configs that cannot produce a working job
pub fn validate(config: &LaunchConfig) -> Result<()> {
    if config.input.directory.trim().is_empty() {
        bail!("[input] directory must be set in {}", LAUNCH_CONFIG_FILE);
    }
    if config.commands.run.trim().is_empty() {
        bail!("[commands] run must be set in {}", LAUNCH_CONFIG_FILE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config = LaunchConfig::parse(TEMPLATE).unwrap();
        assert_eq!(config.input.directory, "");
        assert_eq!(config.input.timeout, "48h");
        assert!(config.commands.setup.contains("Install dependencies"));
        assert_eq!(config.commands.run, "");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config = LaunchConfig::parse(
            r#"
[input]
directory = "./input"
timeout = "1h30m"

[commands]
setup = "pip3 install medusa"
run = "medusa fuzz --target ."
"#,
        )
        .unwrap();
        assert_eq!(config.input.directory, "./input");
        assert_eq!(config.commands.run, "medusa fuzz --target .");
        validate(&config).unwrap();
    }

    #[test]
    fn test_input_dir_relative_to_config() {
        let config = LaunchConfig::parse("[input]\ndirectory = \"corpus\"\n").unwrap();
        assert_eq!(
            config.input_dir(Path::new("/work/project/cloudexec.toml")),
            PathBuf::from("/work/project/corpus")
        );

        let absolute = LaunchConfig::parse("[input]\ndirectory = \"/data\"\n").unwrap();
        assert_eq!(
            absolute.input_dir(Path::new("/work/project/cloudexec.toml")),
            PathBuf::from("/data")
        );
    }

    #[test]
    fn test_write_template_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LAUNCH_CONFIG_FILE);

        write_template(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TEMPLATE);

        std::fs::write(&path, "# mine").unwrap();
        let err = write_template(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");
    }
}
