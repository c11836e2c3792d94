// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Find the credentials for the current environment.
//!
//! [Application Default Credentials] (ADC) looks for credentials in a
//! well-defined sequence of places. This module implements that sequence as
//! an ordered list of [Probe]s, evaluated by [resolve]. The first probe that
//! finds credentials wins, later probes are never evaluated.
//!
//! [default_probes] returns the standard sequence:
//!
//! 1. The file named by the `GOOGLE_APPLICATION_CREDENTIALS` environment
//!    variable.
//! 2. The file created by `gcloud auth application-default login`.
//! 3. A platform identity service, if the application provides one.
//! 4. The metadata service. Set `NO_GCE_CHECK=true` to skip it.
//!
//! There is no process-wide cache. Applications keep the returned [Resolved]
//! and clone its [Credentials] as needed.
//!
//! # Example
//! ```no_run
//! # use cloud_credentials::credentials::resolve::{ProbeOptions, default_probes, resolve};
//! # async fn sample() -> anyhow::Result<()> {
//! let resolved = resolve(default_probes(ProbeOptions::default())).await?;
//! let headers = resolved.credentials.headers().await?;
//! println!("project = {:?}", resolved.project_id);
//! # Ok(()) }
//! ```
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials

use crate::build_errors::Error as BuildError;
use crate::credentials::mds::{self, MetadataClient};
use crate::credentials::platform::{self, IdentityService};
use crate::credentials::{Builder, Credentials, quota_project_from_env};
use crate::http::{HttpTransport, default_transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Result<T> = std::result::Result<T, BuildError>;

const CREDENTIALS_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const PROJECT_ENV_VAR: &str = "GOOGLE_CLOUD_PROJECT";
const NO_GCE_CHECK_ENV_VAR: &str = "NO_GCE_CHECK";
const CLOUDSDK_CONFIG_ENV_VAR: &str = "CLOUDSDK_CONFIG";
const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

/// The result of a successful resolution.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub credentials: Credentials,
    /// The project for the application, if it could be determined.
    pub project_id: Option<String>,
}

/// The outcome of a single [Probe].
#[derive(Debug)]
pub enum Detection {
    /// The source applies, these are its credentials.
    Found(Resolved),
    /// The source does not apply to this environment, with the reason.
    NotApplicable(String),
}

/// A possible source of credentials.
#[async_trait::async_trait]
pub trait Probe: std::fmt::Debug + Send + Sync {
    /// A short name for the source, used in diagnostics.
    fn name(&self) -> &str;

    /// Determines if the source applies and, if so, creates its credentials.
    ///
    /// Return an error created with [BuildError::detection] if the source
    /// cannot determine whether it applies, the chain skips it. Any other
    /// error stops the chain.
    async fn detect(&self) -> Result<Detection>;
}

/// Evaluates `probes` in order and returns the first credentials found.
///
/// The project id is the value of `GOOGLE_CLOUD_PROJECT`, if set, or the
/// project associated with the credentials.
///
/// # Errors
///
/// Returns the first error that is not a detection error. If no probe
/// applies, returns an error naming every source attempted.
pub async fn resolve<I>(probes: I) -> Result<Resolved>
where
    I: IntoIterator<Item = Box<dyn Probe>>,
{
    let mut attempted = Vec::new();
    for probe in probes {
        attempted.push(probe.name().to_string());
        match probe.detect().await {
            Ok(Detection::Found(resolved)) => {
                tracing::debug!(source = probe.name(), "found credentials");
                return Ok(with_project_id(resolved).await);
            }
            Ok(Detection::NotApplicable(reason)) => {
                tracing::debug!(source = probe.name(), "skipping credentials source: {reason}");
            }
            Err(e) if e.is_detection() => {
                tracing::debug!(source = probe.name(), "skipping credentials source: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Err(BuildError::not_found(attempted))
}

async fn with_project_id(resolved: Resolved) -> Resolved {
    if let Some(p) = std::env::var(PROJECT_ENV_VAR).ok().filter(|p| !p.is_empty()) {
        return Resolved {
            project_id: Some(p),
            ..resolved
        };
    }
    if resolved.project_id.is_some() {
        return resolved;
    }
    let project_id = resolved.credentials.project_id().await;
    Resolved {
        project_id,
        ..resolved
    }
}

/// Configures the probes returned by [default_probes].
#[derive(Debug, Default)]
pub struct ProbeOptions {
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    identity_service: Option<Arc<dyn IdentityService>>,
    transport: Option<Arc<dyn HttpTransport>>,
    metadata_endpoint: Option<String>,
}

impl ProbeOptions {
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// The `GOOGLE_CLOUD_QUOTA_PROJECT` environment variable overrides this
    /// value.
    pub fn with_quota_project_id<S: Into<String>>(mut self, v: S) -> Self {
        self.quota_project_id = Some(v.into());
        self
    }

    /// Adds the platform identity probe, backed by `v`.
    pub fn with_identity_service(mut self, v: Arc<dyn IdentityService>) -> Self {
        self.identity_service = Some(v);
        self
    }

    /// The transport used by the metadata service probe and credentials.
    pub fn with_transport(mut self, v: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(v);
        self
    }

    pub fn with_metadata_endpoint<S: Into<String>>(mut self, v: S) -> Self {
        self.metadata_endpoint = Some(v.into());
        self
    }

    fn quota_project_id(&self) -> Option<String> {
        quota_project_from_env().or_else(|| self.quota_project_id.clone())
    }
}

/// Returns the standard sequence of probes.
pub fn default_probes(options: ProbeOptions) -> Vec<Box<dyn Probe>> {
    let options = Arc::new(options);
    let mut probes: Vec<Box<dyn Probe>> = vec![
        Box::new(EnvFileProbe {
            options: options.clone(),
        }),
        Box::new(WellKnownFileProbe {
            options: options.clone(),
        }),
    ];
    if options.identity_service.is_some() {
        probes.push(Box::new(PlatformProbe {
            options: options.clone(),
        }));
    }
    probes.push(Box::new(MetadataProbe { options }));
    probes
}

fn load_file(path: &Path, options: &ProbeOptions) -> Result<Credentials> {
    let contents = std::fs::read(path).map_err(|e| {
        BuildError::loading(format!("cannot read {}: {e}", path.display()))
    })?;
    let json: serde_json::Value = serde_json::from_slice(&contents).map_err(BuildError::parsing)?;
    let mut builder = Builder::new(json);
    if let Some(s) = &options.scopes {
        builder = builder.with_scopes(s.clone());
    }
    if let Some(q) = &options.quota_project_id {
        builder = builder.with_quota_project_id(q);
    }
    builder.build()
}

fn found(credentials: Credentials) -> Detection {
    Detection::Found(Resolved {
        credentials,
        project_id: None,
    })
}

/// Credentials from the file in `GOOGLE_APPLICATION_CREDENTIALS`.
///
/// Once the variable is set the file must exist and contain valid
/// credentials, any problem stops the chain.
#[derive(Debug)]
struct EnvFileProbe {
    options: Arc<ProbeOptions>,
}

#[async_trait::async_trait]
impl Probe for EnvFileProbe {
    fn name(&self) -> &str {
        "environment variable"
    }

    async fn detect(&self) -> Result<Detection> {
        let Some(path) = std::env::var_os(CREDENTIALS_ENV_VAR).filter(|p| !p.is_empty()) else {
            return Ok(Detection::NotApplicable(format!(
                "{CREDENTIALS_ENV_VAR} is not set"
            )));
        };
        load_file(Path::new(&path), &self.options).map(found)
    }
}

/// Credentials from the gcloud configuration directory.
#[derive(Debug)]
struct WellKnownFileProbe {
    options: Arc<ProbeOptions>,
}

pub(crate) fn well_known_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CLOUDSDK_CONFIG_ENV_VAR).filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join(WELL_KNOWN_FILE));
    }
    if cfg!(target_os = "windows") {
        std::env::var_os("APPDATA")
            .map(|d| PathBuf::from(d).join("gcloud").join(WELL_KNOWN_FILE))
    } else {
        std::env::var_os("HOME").map(|d| {
            PathBuf::from(d)
                .join(".config")
                .join("gcloud")
                .join(WELL_KNOWN_FILE)
        })
    }
}

#[async_trait::async_trait]
impl Probe for WellKnownFileProbe {
    fn name(&self) -> &str {
        "well-known file"
    }

    async fn detect(&self) -> Result<Detection> {
        let Some(path) = well_known_path() else {
            return Ok(Detection::NotApplicable(
                "cannot determine the gcloud configuration directory".to_string(),
            ));
        };
        if !path.is_file() {
            return Ok(Detection::NotApplicable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        load_file(&path, &self.options).map(found)
    }
}

#[derive(Debug)]
struct PlatformProbe {
    options: Arc<ProbeOptions>,
}

#[async_trait::async_trait]
impl Probe for PlatformProbe {
    fn name(&self) -> &str {
        "platform identity"
    }

    async fn detect(&self) -> Result<Detection> {
        let Some(service) = self.options.identity_service.clone() else {
            return Ok(Detection::NotApplicable(
                "no identity service configured".to_string(),
            ));
        };
        let mut builder = platform::Builder::new(service);
        if let Some(s) = &self.options.scopes {
            builder = builder.with_scopes(s.clone());
        }
        if let Some(q) = self.options.quota_project_id() {
            builder = builder.with_quota_project_id(q);
        }
        Ok(found(builder.build()))
    }
}

#[derive(Debug)]
struct MetadataProbe {
    options: Arc<ProbeOptions>,
}

fn skip_metadata_check() -> bool {
    std::env::var(NO_GCE_CHECK_ENV_VAR)
        .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

#[async_trait::async_trait]
impl Probe for MetadataProbe {
    fn name(&self) -> &str {
        "metadata service"
    }

    async fn detect(&self) -> Result<Detection> {
        if skip_metadata_check() {
            return Ok(Detection::NotApplicable(format!(
                "{NO_GCE_CHECK_ENV_VAR} is set"
            )));
        }
        let transport = self
            .options
            .transport
            .clone()
            .unwrap_or_else(default_transport);
        let client = MetadataClient::new(self.options.metadata_endpoint.clone(), transport.clone());
        if !client.ping().await.map_err(BuildError::detection)? {
            return Ok(Detection::NotApplicable(
                "the metadata service did not respond as expected".to_string(),
            ));
        }
        let mut builder = mds::Builder::default().with_transport(transport);
        if let Some(e) = &self.options.metadata_endpoint {
            builder = builder.with_endpoint(e);
        }
        if let Some(s) = &self.options.scopes {
            builder = builder.with_scopes(s.clone());
        }
        if let Some(q) = self.options.quota_project_id() {
            builder = builder.with_quota_project_id(q);
        }
        Ok(found(builder.build()))
    }
}
