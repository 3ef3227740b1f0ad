//! cloud-init user data for job instances
//!
//! The script is rendered before the job id exists; the instance reads its id
//! and owner back from the metadata service tags set at creation.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use cx_core::Settings;

use crate::launch_config::LaunchConfig;

const TEMPLATE: &str = include_str!("user_data.sh.tmpl");

/// Render the instance bootstrap script
pub fn generate(settings: &Settings, launch: &LaunchConfig) -> Result<String> {
    let timeout = parse_duration(&launch.input.timeout)
        .map_err(|e| anyhow!("Failed to parse timeout of {}: {}", launch.input.timeout, e))?;

    let digitalocean = &settings.digitalocean;
    let values: HashMap<&str, String> = HashMap::from([
        ("SpacesAccessKey", digitalocean.spaces_access_key.clone()),
        ("SpacesSecretKey", digitalocean.spaces_secret_key.clone()),
        ("SpacesRegion", digitalocean.spaces_region.clone()),
        ("DigitalOceanToken", digitalocean.api_key.clone()),
        // both end up inside double quotes in the script
        ("SetupCommands", launch.commands.setup.replace('"', "\\\"")),
        ("RunCommand", launch.commands.run.replace('"', "\\\"")),
        ("Timeout", timeout.as_secs().to_string()),
        ("InputDirectory", launch.input.directory.clone()),
    ]);

    render(TEMPLATE, &values)
}

/// Single pass `{{Name}}` substitution. Substituted text is never rescanned.
fn render(template: &str, values: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| anyhow!("Unterminated placeholder in user data template"))?;
        let name = after[..end].trim();
        let value = values
            .get(name)
            .ok_or_else(|| anyhow!("Unknown placeholder {{{{{}}}}} in user data template", name))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parse a duration such as `48h`, `90s` or `1h2m3.5s`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        bail!("empty duration");
    }
    if input.starts_with('-') {
        bail!("negative duration {:?}", raw);
    }
    let input = input.strip_prefix('+').unwrap_or(input);
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_len];
        if number.is_empty() || number == "." {
            bail!("invalid duration {:?}", raw);
        }
        let value: f64 = number
            .parse()
            .map_err(|_| anyhow!("invalid duration {:?}", raw))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => bail!("missing unit in duration {:?}", raw),
            unit => bail!("unknown unit {:?} in duration {:?}", unit, raw),
        };
        rest = &rest[unit_len..];
        total_nanos += value * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
