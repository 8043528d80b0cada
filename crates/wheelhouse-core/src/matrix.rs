//! Build matrix: typed axes, exclusion rules and cross-product expansion.
//!
//! A [`MatrixSpec`] declares three axes (platform, interpreter version,
//! architecture). [`MatrixSpec::expand_cells`] produces every surviving
//! [`BuildCell`] in a deterministic order: platforms in declaration order,
//! then architectures, then ascending interpreter versions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WheelhouseError};

/// Default ceiling on concurrently running jobs.
pub const DEFAULT_MAX_PARALLEL: usize = 20;

/// Operating system a job builds for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
        }
    }

    /// Whether one job builds every interpreter tag of this platform.
    ///
    /// Linux builds run inside a pinned container that iterates the
    /// interpreter tags itself, so the matrix collapses to one job per
    /// architecture.
    pub fn fans_out_internally(&self) -> bool {
        matches!(self, Platform::Linux)
    }

    /// Fragments that must all appear in a wheel's platform tag.
    pub fn wheel_tag_fragments(&self, arch: Architecture) -> &'static [&'static str] {
        match (self, arch) {
            (Platform::Linux, Architecture::X64) => &["manylinux", "x86_64"],
            (Platform::Linux, Architecture::X86) => &["manylinux", "i686"],
            (Platform::Linux, Architecture::Arm64) => &["manylinux", "aarch64"],
            (Platform::Macos, Architecture::X64) => &["macosx", "x86_64"],
            (Platform::Macos, Architecture::X86) => &["macosx", "i386"],
            (Platform::Macos, Architecture::Arm64) => &["macosx", "arm64"],
            (Platform::Windows, Architecture::X64) => &["win_amd64"],
            (Platform::Windows, Architecture::X86) => &["win32"],
            (Platform::Windows, Architecture::Arm64) => &["win_arm64"],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of a build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    X86,
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::X86 => "x86",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPython `major.minor` version, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterpreterVersion {
    pub major: u8,
    pub minor: u8,
}

impl InterpreterVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Python tag, e.g. `cp38`.
    pub fn python_tag(&self) -> String {
        format!("cp{}{}", self.major, self.minor)
    }

    /// ABI tag. CPython up to 3.7 carries the pymalloc `m` suffix.
    pub fn abi_tag(&self) -> String {
        if (self.major, self.minor) <= (3, 7) {
            format!("cp{}{}m", self.major, self.minor)
        } else {
            self.python_tag()
        }
    }

    /// Combined interpreter tag used by manylinux images, e.g. `cp37-cp37m`.
    pub fn interpreter_tag(&self) -> String {
        format!("{}-{}", self.python_tag(), self.abi_tag())
    }

    /// Interpreter executable name on hosts with several interpreters.
    pub fn executable(&self) -> String {
        format!("python{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for InterpreterVersion {
    type Err = WheelhouseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WheelhouseError::InvalidMatrix(format!("invalid interpreter version '{s}'"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for InterpreterVersion {
    type Error = WheelhouseError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<InterpreterVersion> for String {
    fn from(value: InterpreterVersion) -> Self {
        value.to_string()
    }
}

/// One (platform, interpreter version, architecture) combination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildCell {
    pub platform: Platform,
    pub interpreter_version: InterpreterVersion,
    pub architecture: Architecture,
}

impl BuildCell {
    pub fn new(
        platform: Platform,
        interpreter_version: InterpreterVersion,
        architecture: Architecture,
    ) -> Self {
        Self {
            platform,
            interpreter_version,
            architecture,
        }
    }

    /// Stable slug, e.g. `windows-3.8-x64`.
    pub fn slug(&self) -> String {
        format!(
            "{}-{}-{}",
            self.platform, self.interpreter_version, self.architecture
        )
    }
}

/// Partial cell pattern. Unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_version: Option<InterpreterVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
}

impl CellFilter {
    pub fn matches(&self, cell: &BuildCell) -> bool {
        self.platform.map_or(true, |p| p == cell.platform)
            && self
                .interpreter_version
                .map_or(true, |v| v == cell.interpreter_version)
            && self.architecture.map_or(true, |a| a == cell.architecture)
    }
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_architectures() -> Vec<Architecture> {
    vec![Architecture::X64]
}

/// Declarative matrix: axes, exclusions, advisory cells and parallelism bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixSpec {
    #[serde(rename = "platform")]
    pub platforms: Vec<Platform>,
    #[serde(rename = "interpreter_version")]
    pub interpreter_versions: Vec<InterpreterVersion>,
    #[serde(rename = "architecture", default = "default_architectures")]
    pub architectures: Vec<Architecture>,
    /// Cells removed from the cross-product.
    #[serde(default)]
    pub exclude: Vec<CellFilter>,
    /// Cells whose failure does not fail the aggregate result.
    #[serde(default)]
    pub advisory: Vec<CellFilter>,
    /// Maximum number of concurrently running jobs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl MatrixSpec {
    pub fn new(
        platforms: Vec<Platform>,
        interpreter_versions: Vec<InterpreterVersion>,
        architectures: Vec<Architecture>,
    ) -> Self {
        Self {
            platforms,
            interpreter_versions,
            architectures,
            exclude: Vec::new(),
            advisory: Vec::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_exclusion(mut self, filter: CellFilter) -> Self {
        self.exclude.push(filter);
        self
    }

    pub fn with_advisory(mut self, filter: CellFilter) -> Self {
        self.advisory.push(filter);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            return Err(WheelhouseError::InvalidMatrix("platform axis is empty".into()));
        }
        if self.interpreter_versions.is_empty() {
            return Err(WheelhouseError::InvalidMatrix(
                "interpreter_version axis is empty".into(),
            ));
        }
        if self.architectures.is_empty() {
            return Err(WheelhouseError::InvalidMatrix(
                "architecture axis is empty".into(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(WheelhouseError::InvalidMatrix(
                "max_parallel must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Expand the cross-product minus exclusions.
    ///
    /// Duplicate axis values collapse; the result never contains the same
    /// cell twice.
    pub fn expand_cells(&self) -> Result<Vec<BuildCell>> {
        self.validate()?;

        let mut platforms = Vec::new();
        for p in &self.platforms {
            if !platforms.contains(p) {
                platforms.push(*p);
            }
        }
        let mut architectures = Vec::new();
        for a in &self.architectures {
            if !architectures.contains(a) {
                architectures.push(*a);
            }
        }
        let versions: BTreeSet<InterpreterVersion> =
            self.interpreter_versions.iter().copied().collect();

        let mut cells = Vec::new();
        for platform in &platforms {
            for arch in &architectures {
                for version in &versions {
                    let cell = BuildCell::new(*platform, *version, *arch);
                    if self.exclude.iter().any(|f| f.matches(&cell)) {
                        continue;
                    }
                    cells.push(cell);
                }
            }
        }
        Ok(cells)
    }

    /// Whether a cell is advisory (its failure is reported but not fatal).
    pub fn is_advisory(&self, cell: &BuildCell) -> bool {
        self.advisory.iter().any(|f| f.matches(cell))
    }
}
