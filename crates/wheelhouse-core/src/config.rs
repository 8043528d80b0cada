//! Pipeline configuration loaded from `wheelhouse.toml`.
//!
//! Every section is optional. Credentials are deliberately absent: they
//! come from a [`crate::credentials::CredentialSource`] at event time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WheelhouseError};
use crate::matrix::{Architecture, BuildCell, InterpreterVersion, MatrixSpec, Platform};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "wheelhouse.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default = "default_matrix")]
    pub matrix: MatrixSpec,
    #[serde(default)]
    pub sdist: SdistConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub lint: LintConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub linux: LinuxConfig,
    #[serde(default)]
    pub windows: WindowsConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_matrix() -> MatrixSpec {
    MatrixSpec::new(
        vec![Platform::Linux, Platform::Macos, Platform::Windows],
        vec![
            InterpreterVersion::new(3, 7),
            InterpreterVersion::new(3, 8),
            InterpreterVersion::new(3, 9),
        ],
        vec![Architecture::X64],
    )
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            package: PackageConfig::default(),
            matrix: default_matrix(),
            sdist: SdistConfig::default(),
            dependencies: DependencyConfig::default(),
            build: BuildConfig::default(),
            lint: LintConfig::default(),
            test: TestConfig::default(),
            linux: LinuxConfig::default(),
            windows: WindowsConfig::default(),
            publish: PublishConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.package.name.trim().is_empty() {
            return Err(WheelhouseError::InvalidConfig(
                "package.name must not be empty".into(),
            ));
        }
        self.matrix.validate()?;
        if !self
            .matrix
            .interpreter_versions
            .contains(&self.sdist.interpreter_version)
        {
            return Err(WheelhouseError::InvalidConfig(format!(
                "sdist interpreter_version {} is not in the matrix",
                self.sdist.interpreter_version
            )));
        }
        if let Some(platform) = self.sdist.platform {
            if !self.matrix.platforms.contains(&platform) {
                return Err(WheelhouseError::InvalidConfig(format!(
                    "sdist platform {platform} is not in the matrix"
                )));
            }
        }
        // Releases must be able to designate an sdist job after exclusions.
        if !self.matrix.expand_cells()?.iter().any(|cell| self.sdist.matches(cell)) {
            return Err(WheelhouseError::InvalidConfig(format!(
                "no matrix cell left for the sdist ({}{}) after exclusions",
                self.sdist.interpreter_version,
                self.sdist
                    .platform
                    .map(|p| format!(" on {p}"))
                    .unwrap_or_default()
            )));
        }
        if self.lint.enabled && self.lint.command.is_empty() {
            return Err(WheelhouseError::InvalidConfig(
                "lint.command must not be empty".into(),
            ));
        }
        if self.test.enabled && self.test.command.is_empty() {
            return Err(WheelhouseError::InvalidConfig(
                "test.command must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Platforms whose jobs run the test suite.
    pub fn test_platforms(&self) -> Vec<Platform> {
        if !self.test.enabled {
            return Vec::new();
        }
        self.test.platforms.clone()
    }

    /// Platforms with a lint gate. Defaults to the test platforms.
    pub fn lint_platforms(&self) -> Vec<Platform> {
        if !self.lint.enabled {
            return Vec::new();
        }
        self.lint
            .platforms
            .clone()
            .unwrap_or_else(|| self.test_platforms())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageConfig {
    /// Distribution name as published on the index.
    #[serde(default = "default_package_name")]
    pub name: String,
    /// Checkout containing `setup.py`.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Root for per-job isolated work directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_package_name() -> String {
    "aequilibrae".to_string()
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("build/wheelhouse")
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: default_package_name(),
            source_dir: default_source_dir(),
            work_dir: default_work_dir(),
        }
    }
}

impl PackageConfig {
    /// Name as it appears in wheel and sdist file names.
    pub fn dist_name(&self) -> String {
        self.name.replace('-', "_")
    }
}

/// Which cell publishes the source distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdistConfig {
    #[serde(default = "default_sdist_version")]
    pub interpreter_version: InterpreterVersion,
    /// Restrict to one platform; otherwise the first matching job wins.
    #[serde(default)]
    pub platform: Option<Platform>,
}

fn default_sdist_version() -> InterpreterVersion {
    InterpreterVersion::new(3, 8)
}

impl SdistConfig {
    /// Whether `cell` may build the sdist.
    pub fn matches(&self, cell: &BuildCell) -> bool {
        cell.interpreter_version == self.interpreter_version
            && self.platform.map_or(true, |p| p == cell.platform)
    }
}

impl Default for SdistConfig {
    fn default() -> Self {
        Self {
            interpreter_version: default_sdist_version(),
            platform: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyConfig {
    /// Packages installed into the build interpreter.
    #[serde(default = "default_build_packages")]
    pub packages: Vec<String>,
    /// Requirement files, relative to the source dir.
    #[serde(default)]
    pub requirements: Vec<PathBuf>,
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,
}

fn default_build_packages() -> Vec<String> {
    ["pip", "setuptools", "wheel", "cython", "numpy"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_install_timeout() -> u64 {
    900
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            packages: default_build_packages(),
            requirements: Vec::new(),
            timeout_secs: default_install_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildConfig {
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

fn default_build_timeout() -> u64 {
    3600
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_build_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LintConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lint_command")]
    pub command: Vec<String>,
    /// Gated platforms; defaults to the test platforms.
    #[serde(default)]
    pub platforms: Option<Vec<Platform>>,
    #[serde(default = "default_lint_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_lint_command() -> Vec<String> {
    ["python", "-m", "flake8"].iter().map(|s| s.to_string()).collect()
}

fn default_lint_timeout() -> u64 {
    600
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_lint_command(),
            platforms: None,
            timeout_secs: default_lint_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_test_command")]
    pub command: Vec<String>,
    /// Platforms whose jobs run the suite against the in-place build.
    #[serde(default = "default_test_platforms")]
    pub platforms: Vec<Platform>,
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,
}

fn default_test_command() -> Vec<String> {
    ["python", "-m", "pytest", "tests"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_test_platforms() -> Vec<Platform> {
    vec![Platform::Windows]
}

fn default_test_timeout() -> u64 {
    1800
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_test_command(),
            platforms: default_test_platforms(),
            timeout_secs: default_test_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinuxConfig {
    /// Image name without the architecture suffix.
    #[serde(default = "default_manylinux_prefix")]
    pub image_prefix: String,
}

fn default_manylinux_prefix() -> String {
    "quay.io/pypa/manylinux2014".to_string()
}

impl Default for LinuxConfig {
    fn default() -> Self {
        Self {
            image_prefix: default_manylinux_prefix(),
        }
    }
}

impl LinuxConfig {
    /// ABI-pinned image for an architecture.
    pub fn image(&self, arch: Architecture) -> String {
        let suffix = match arch {
            Architecture::X64 => "x86_64",
            Architecture::X86 => "i686",
            Architecture::Arm64 => "aarch64",
        };
        format!("{}_{}", self.image_prefix, suffix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowsConfig {
    /// Archive with the spatial-data extension staged before compiling.
    #[serde(default = "default_spatialite_url")]
    pub spatialite_url: String,
    /// Staging directory, relative to the job work dir.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_spatialite_url() -> String {
    "http://www.gaia-gis.it/gaia-sins/windows-bin-amd64/mod_spatialite-4.3.0a-win-amd64.7z"
        .to_string()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("spatialite")
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            spatialite_url: default_spatialite_url(),
            staging_dir: default_staging_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    #[serde(default = "default_repository_url")]
    pub repository_url: String,
    /// Object store bucket URL (e.g. `s3://bucket`). Mirroring is
    /// reported as failed when unset.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    /// Workflow-attached storage for `push` archives.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
}

fn default_repository_url() -> String {
    "https://upload.pypi.org/legacy/".to_string()
}

fn default_store_prefix() -> String {
    "wheels".to_string()
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("build/wheelhouse/archive")
}

fn default_publish_timeout() -> u64 {
    600
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            repository_url: default_repository_url(),
            bucket: None,
            prefix: default_store_prefix(),
            archive_dir: default_archive_dir(),
            timeout_secs: default_publish_timeout(),
        }
    }
}
