use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::LauncherError;

/// One edge of a branch's version lineage: apply `diff_url` to version `from` to get `to`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PatchStep {
    pub from: u32,
    pub to: u32,
    #[serde(rename = "pwr")]
    pub diff_url: String,
    #[serde(rename = "pwrHead", default)]
    pub diff_head_url: String,
    #[serde(rename = "sig")]
    pub signature_url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PatchQuery {
    pub os: String,
    pub arch: String,
    pub branch: String,
    /// The service expects the starting version as a string.
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PatchStepsResponse {
    #[serde(default)]
    pub steps: Vec<PatchStep>,
}

/// Which build of a branch an install tracks.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BuildSelector {
    /// Rolling install that follows the newest version; its version lives in a sentinel file.
    Auto,
    /// Newest version, installed into a directory named after the number.
    Latest,
    Fixed(u32),
}

impl BuildSelector {
    pub fn dir_name(&self, resolved: u32) -> String {
        match self {
            BuildSelector::Auto => "auto".to_string(),
            BuildSelector::Latest | BuildSelector::Fixed(_) => resolved.to_string(),
        }
    }
}

impl FromStr for BuildSelector {
    type Err = LauncherError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BuildSelector::Auto),
            "latest" => Ok(BuildSelector::Latest),
            other => other
                .parse::<u32>()
                .ok()
                .filter(|version| *version > 0)
                .map(BuildSelector::Fixed)
                .ok_or_else(|| LauncherError::Config(format!("invalid build selector: {value}"))),
        }
    }
}

impl fmt::Display for BuildSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildSelector::Auto => write!(f, "auto"),
            BuildSelector::Latest => write!(f, "latest"),
            BuildSelector::Fixed(version) => write!(f, "{version}"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstallRequest {
    pub branch: String,
    pub build: BuildSelector,
}

/// Everything the process-launch collaborator needs to start a verified install.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPlan {
    pub branch: String,
    pub version: u32,
    pub game_dir: PathBuf,
    pub client_path: PathBuf,
    pub runtime_path: PathBuf,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PlaySession {
    pub player_name: String,
    pub session_token: String,
    pub identity_token: Option<String>,
}
