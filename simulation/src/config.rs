//! Resolve the active simulation profile.
//!
//! Configuration is read from a JSON document in one of two shapes:
//!
//! ```json
//! {
//!   "profiles": { "dev": { "enable": true, "ber": 1e-6 }, "gpu": { "tops_scale": 0.5 } },
//!   "default_profile": "dev"
//! }
//! ```
//!
//! or, for backward compatibility, a single flat [SimulationConfig].
//!
//! When the document contains `profiles`, the active profile name is chosen by (in order):
//! the `EXO_SIMULATION_PROFILE` override, the trimmed contents of a selector file,
//! `default_profile`, and finally the first profile in declaration order. If the chosen
//! name does not refer to a profile object, `default_profile` is used instead, and if that
//! is also unusable, the first profile object found.
//!
//! Resolution never fails from the caller's perspective: any error (missing file, malformed
//! JSON, failed validation, missing profile) means simulation is inactive.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::{debug, warn};

/// Environment variable overriding the path of the configuration document.
pub const CONFIG_ENV: &str = "EXO_SIMULATION_CONFIG";

/// Environment variable overriding the path of the profile selector file.
pub const PROFILE_FILE_ENV: &str = "EXO_SIMULATION_PROFILE_FILE";

/// Environment variable naming the active profile (highest precedence).
pub const PROFILE_ENV: &str = "EXO_SIMULATION_PROFILE";

/// Default path of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "exo/config/simulation.json";

/// Default path of the profile selector file.
pub const DEFAULT_PROFILE_FILE: &str = "exo/config/.simulation_profile";

/// Where corruption should be applied by the host.
///
/// The scope is carried, not interpreted, by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    ForwardTensor,
    OutputTensor,
    TokenSampling,
}

/// A validated simulation profile.
///
/// When `enable` is false, all other fields are inert.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Master switch.
    #[serde(default)]
    pub enable: bool,

    /// Seed for reproducible randomness (absent means non-reproducible).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Absolute compute capability override (fp16 TFLOPS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tops_override_fp16_tflops: Option<f64>,

    /// Relative compute multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tops_scale: Option<f64>,

    /// Probability that any given bit is flipped (in range [0,1]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ber: Option<f64>,

    /// Where the host should apply corruption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ber_scope: Option<Scope>,

    /// Reserved for hosts blending real and simulated signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighting_alpha: Option<f64>,
}

impl SimulationConfig {
    /// Deserialize and validate a single profile object.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let config: Self = serde_json::from_value(value).map_err(Error::Invalid)?;
        config.validate()
    }

    fn validate(self) -> Result<Self, Error> {
        if let Some(ber) = self.ber {
            if !(0.0..=1.0).contains(&ber) {
                return Err(Error::InvalidBitErrorRate(ber));
            }
        }
        Ok(self)
    }
}

/// Locations consulted when resolving a [SimulationConfig].
#[derive(Clone, Debug)]
pub struct Sources {
    /// Path of the configuration document.
    pub config_path: PathBuf,

    /// Path of the (optional) profile selector file.
    pub profile_file: PathBuf,

    /// Explicit profile name, taking precedence over everything else.
    pub profile: Option<String>,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            profile_file: PathBuf::from(DEFAULT_PROFILE_FILE),
            profile: None,
        }
    }
}

impl Sources {
    /// Capture sources from the process environment.
    ///
    /// Empty variables are treated as unset.
    pub fn from_env() -> Self {
        let var = |key: &str| env::var(key).ok().filter(|value: &String| !value.is_empty());
        let defaults = Self::default();
        Self {
            config_path: var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            profile_file: var(PROFILE_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.profile_file),
            profile: var(PROFILE_ENV),
        }
    }
}

/// Read the profile name from the selector file, if any.
fn read_selector(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let name = content.trim();
            (!name.is_empty()).then(|| name.to_owned())
        }
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                debug!(?path, ?err, "skipping unreadable profile selector");
            }
            None
        }
    }
}

/// Pick a profile from a multi-profile document.
fn select(
    document: &Value,
    profiles: &Map<String, Value>,
    sources: &Sources,
) -> Result<SimulationConfig, Error> {
    let default = document
        .get("default_profile")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty());
    let name = sources
        .profile
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| read_selector(&sources.profile_file))
        .or_else(|| default.map(str::to_owned))
        .or_else(|| profiles.keys().next().cloned())
        .ok_or(Error::NoProfile)?;

    let entry = match profiles.get(&name) {
        Some(Value::Object(entry)) => entry,
        _ => {
            debug!(%name, ?default, "requested profile unusable, falling back");
            default
                .and_then(|default| profiles.get(default))
                .and_then(Value::as_object)
                .or_else(|| profiles.values().find_map(Value::as_object))
                .ok_or(Error::NoProfile)?
        }
    };
    SimulationConfig::from_value(Value::Object(entry.clone()))
}

/// Resolve a [SimulationConfig] from the given sources without caching.
pub fn load(sources: &Sources) -> Result<SimulationConfig, Error> {
    let path = &sources.config_path;
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::ConfigMissing(path.clone()))
        }
        Err(err) => return Err(Error::ConfigUnreadable(path.clone(), err)),
    };
    let document: Value = serde_json::from_str(&raw).map_err(Error::Malformed)?;
    if let Some(Value::Object(profiles)) = document.get("profiles") {
        return select(&document, profiles, sources);
    }
    SimulationConfig::from_value(document)
}

/// Lazily resolves (and then memoizes) the active [SimulationConfig].
///
/// The first resolution is final, whether it succeeded or not. Collaborators hold
/// a reference to the resolver rather than reading global state.
pub struct Resolver {
    sources: Sources,
    outcome: OnceLock<Result<SimulationConfig, Error>>,
}

impl Resolver {
    /// Create a resolver over the given sources.
    pub fn new(sources: Sources) -> Self {
        Self {
            sources,
            outcome: OnceLock::new(),
        }
    }

    /// Create a resolver over [Sources::from_env].
    pub fn from_env() -> Self {
        Self::new(Sources::from_env())
    }

    /// Create a resolver that is already resolved to the given configuration.
    pub fn fixed(config: SimulationConfig) -> Self {
        Self {
            sources: Sources::default(),
            outcome: OnceLock::from(Ok(config)),
        }
    }

    /// Sources consulted by this resolver.
    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    /// Resolve (at most once) and return the outcome, including any error.
    pub fn outcome(&self) -> &Result<SimulationConfig, Error> {
        self.outcome.get_or_init(|| {
            let outcome = load(&self.sources);
            match &outcome {
                Ok(config) => debug!(
                    path = ?self.sources.config_path,
                    enable = config.enable,
                    "resolved simulation config"
                ),
                Err(Error::ConfigMissing(path)) => {
                    debug!(?path, "no simulation config")
                }
                Err(err) => warn!(?err, "ignoring simulation config"),
            }
            outcome
        })
    }

    /// Return the resolved configuration, if any.
    pub fn get(&self) -> Option<&SimulationConfig> {
        self.outcome().as_ref().ok()
    }

    /// Return the resolved configuration only if it is enabled.
    ///
    /// This is the gate every caller should check before paying any simulation cost.
    pub fn active(&self) -> Option<&SimulationConfig> {
        self.get().filter(|config| config.enable)
    }

    /// Forget the memoized outcome so the next read resolves again.
    pub fn reset(&mut self) {
        self.outcome.take();
    }
}

/// Process-wide resolver built from the environment on first use.
pub fn global() -> &'static Resolver {
    static GLOBAL: OnceLock<Resolver> = OnceLock::new();
    GLOBAL.get_or_init(Resolver::from_env)
}
