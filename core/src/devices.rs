//! Device collaborator seam. The dispatcher turns steps into [`DeviceOp`]s and
//! hands them to a [`DeviceBackend`]; protocols live behind the trait.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::cfg::DevicesCfg;
use crate::macros::OnOff;

/// One primitive device operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    /// Read a home-automation entity's state.
    HaState {
        /// Entity id.
        entity: String,
    },
    /// Call a home-automation service.
    HaService {
        /// Domain.
        domain: String,
        /// Service.
        service: String,
        /// Payload.
        data: Value,
    },
    /// Route matrix transmitter -> receiver.
    MatrixSwitch {
        /// Transmitter.
        tx: String,
        /// Receiver.
        rx: String,
    },
    /// Send an IR code from a matrix receiver.
    MatrixIr {
        /// Receiver.
        receiver: String,
        /// Code.
        code: String,
    },
    /// Power one projector.
    ProjectorPower {
        /// Projector key.
        projector: String,
        /// Target state.
        state: OnOff,
    },
    /// Power every projector, best effort.
    ProjectorPowerAll {
        /// Target state.
        state: OnOff,
    },
    /// Recall a mixer scene.
    MixerScene {
        /// Scene number.
        scene: u32,
    },
    /// Mute/unmute a mixer channel.
    MixerMute {
        /// Channel.
        channel: u32,
        /// `On` = muted.
        state: OnOff,
    },
    /// Streaming encoder request.
    Streaming {
        /// Request type.
        action: String,
        /// Payload.
        data: Option<Value>,
    },
    /// Recall a camera preset.
    CameraPreset {
        /// Camera key.
        camera: String,
        /// Preset number.
        preset: u32,
    },
}

impl DeviceOp {
    /// Device family, for logs.
    pub fn family(&self) -> &'static str {
        match self {
            DeviceOp::HaState { .. } | DeviceOp::HaService { .. } => "home_automation",
            DeviceOp::MatrixSwitch { .. } | DeviceOp::MatrixIr { .. } => "matrix",
            DeviceOp::ProjectorPower { .. } | DeviceOp::ProjectorPowerAll { .. } => "projector",
            DeviceOp::MixerScene { .. } | DeviceOp::MixerMute { .. } => "mixer",
            DeviceOp::Streaming { .. } => "streaming",
            DeviceOp::CameraPreset { .. } => "camera",
        }
    }
}

/// What a device answered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReply {
    /// HTTP-like status; `< 400` is success.
    pub status: u16,
    /// Entity state for [`DeviceOp::HaState`].
    pub state: Option<String>,
    /// Device-provided error text.
    pub error: Option<String>,
}

impl DeviceReply {
    /// 200 with no payload.
    pub fn ok() -> Self { Self { status: 200, ..Self::default() } }

    /// 200 carrying an entity state.
    pub fn with_state(state: impl Into<String>) -> Self {
        Self { status: 200, state: Some(state.into()), error: None }
    }

    /// Failed reply.
    pub fn failed(status: u16, error: impl Into<String>) -> Self {
        Self { status, state: None, error: Some(error.into()) }
    }

    /// `status < 400`.
    pub fn is_success(&self) -> bool { self.status < 400 }
}

/// Performs device operations. Transport faults come back as `Err`; the
/// dispatcher turns them into step failures.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Run one operation.
    async fn perform(&self, op: &DeviceOp) -> Result<DeviceReply>;
}

/* --------------------- MockBackend --------------------- */

/// Offline back end. Entity states come from a table (unlisted ones read
/// `on`); projector and camera keys must still be configured.
#[derive(Default)]
pub struct MockBackend {
    ha_states: BTreeMap<String, String>,
    projectors: BTreeSet<String>,
    cameras: BTreeSet<String>,
    log: Mutex<Vec<DeviceOp>>,
}

impl MockBackend {
    /// Mock reporting `ha_states` for state reads, with no projectors or cameras.
    pub fn new(ha_states: BTreeMap<String, String>) -> Self {
        Self { ha_states, ..Self::default() }
    }

    /// Accept the projector and camera keys named in `devices`.
    pub fn with_devices(mut self, devices: &DevicesCfg) -> Self {
        self.projectors = devices.projectors.keys().cloned().collect();
        self.cameras = devices.cameras.keys().cloned().collect();
        self
    }

    /// Operations performed so far, oldest first.
    pub fn performed(&self) -> Vec<DeviceOp> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    async fn perform(&self, op: &DeviceOp) -> Result<DeviceReply> {
        if let Ok(mut log) = self.log.lock() {
            log.push(op.clone());
        }
        Ok(match op {
            DeviceOp::HaState { entity } => {
                DeviceReply::with_state(self.ha_states.get(entity).map_or("on", String::as_str))
            }
            DeviceOp::ProjectorPower { projector, .. } if !self.projectors.contains(projector) => {
                DeviceReply::failed(404, format!("Unknown projector: {projector}"))
            }
            DeviceOp::CameraPreset { camera, .. } if !self.cameras.contains(camera) => {
                DeviceReply::failed(404, format!("Unknown camera: {camera}"))
            }
            _ => DeviceReply::ok(),
        })
    }
}

/* --------------------- HttpBackend --------------------- */

#[cfg(feature = "runner-http")]
pub use http::HttpBackend;

#[cfg(feature = "runner-http")]
mod http {
    use super::*;
    use anyhow::{anyhow, Context};
    use reqwest::Client;
    use serde_json::json;
    use std::time::Duration;
    use tracing::{debug, warn};

    use crate::cfg::DevicesCfg;

    /// Talks to the device middlewares, projectors, cameras and the
    /// home-automation hub over HTTP.
    pub struct HttpBackend {
        client: Client,
        cfg: DevicesCfg,
    }

    impl HttpBackend {
        /// Back end for the configured endpoints.
        pub fn new(cfg: DevicesCfg) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_millis(cfg.timeout_ms))
                .build()
                .context("build http client")?;
            Ok(Self { client, cfg })
        }

        fn base(url: &Option<String>, what: &str) -> Result<String> {
            url.as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .ok_or_else(|| anyhow!("{what} url not configured"))
        }

        async fn get(&self, url: String) -> Result<DeviceReply> {
            debug!(%url, "device GET");
            let resp = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
            Ok(reply_for(resp.status().as_u16()))
        }

        async fn post(&self, url: String, body: &Value) -> Result<DeviceReply> {
            debug!(%url, "device POST");
            let resp = self.client.post(&url).json(body).send().await
                .with_context(|| format!("POST {url}"))?;
            Ok(reply_for(resp.status().as_u16()))
        }

        fn projector_url(host: &str, state: OnOff) -> String {
            format!("http://{host}/api/v01/contentmgr/remote/power/{state}")
        }
    }

    fn reply_for(status: u16) -> DeviceReply {
        if status < 400 {
            DeviceReply { status, ..DeviceReply::default() }
        } else {
            DeviceReply::failed(status, format!("status={status}"))
        }
    }

    #[async_trait]
    impl DeviceBackend for HttpBackend {
        async fn perform(&self, op: &DeviceOp) -> Result<DeviceReply> {
            match op {
                DeviceOp::HaState { entity } => {
                    let ha = self.cfg.home_automation.as_ref()
                        .ok_or_else(|| anyhow!("home automation not configured"))?;
                    let url = format!("{}/api/states/{entity}", ha.url.trim_end_matches('/'));
                    let resp = self.client.get(&url)
                        .bearer_auth(&ha.token)
                        .timeout(Duration::from_millis(ha.timeout_ms))
                        .send().await
                        .with_context(|| format!("HA check failed: GET {url}"))?;
                    let status = resp.status().as_u16();
                    let body: Value = resp.json().await.context("HA check failed: bad body")?;
                    let state = match body.get("state") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    Ok(DeviceReply { status, state: Some(state), error: None })
                }
                DeviceOp::HaService { domain, service, data } => {
                    let ha = self.cfg.home_automation.as_ref()
                        .ok_or_else(|| anyhow!("home automation not configured"))?;
                    let url = format!("{}/api/services/{domain}/{service}", ha.url.trim_end_matches('/'));
                    let resp = self.client.post(&url)
                        .bearer_auth(&ha.token)
                        .timeout(Duration::from_millis(ha.timeout_ms))
                        .json(data)
                        .send().await
                        .with_context(|| format!("HA service failed: POST {url}"))?;
                    let status = resp.status().as_u16();
                    if status < 400 {
                        Ok(DeviceReply { status, ..DeviceReply::default() })
                    } else {
                        Ok(DeviceReply::failed(status, format!("HA service returned {status}")))
                    }
                }
                DeviceOp::MatrixSwitch { tx, rx } => {
                    let base = Self::base(&self.cfg.matrix_url, "matrix")?;
                    self.post(format!("{base}/switch"), &json!({"transmitter": tx, "receiver": rx})).await
                }
                DeviceOp::MatrixIr { receiver, code } => {
                    let base = Self::base(&self.cfg.matrix_url, "matrix")?;
                    self.post(format!("{base}/ir"), &json!({"tx": "0", "rx": receiver, "code": code})).await
                }
                DeviceOp::ProjectorPower { projector, state } => {
                    let host = self.cfg.projectors.get(projector)
                        .ok_or_else(|| anyhow!("Unknown projector: {projector}"))?;
                    self.get(Self::projector_url(host, *state)).await
                }
                DeviceOp::ProjectorPowerAll { state } => {
                    for (key, host) in &self.cfg.projectors {
                        if let Err(e) = self.get(Self::projector_url(host, *state)).await {
                            warn!(projector = %key, "power {state} failed: {e:#}");
                        }
                    }
                    Ok(DeviceReply::ok())
                }
                DeviceOp::MixerScene { scene } => {
                    let base = Self::base(&self.cfg.mixer_url, "mixer")?;
                    self.get(format!("{base}/scene{scene}")).await
                }
                DeviceOp::MixerMute { channel, state } => {
                    let base = Self::base(&self.cfg.mixer_url, "mixer")?;
                    self.get(format!("{base}/mute{channel}{state}")).await
                }
                DeviceOp::Streaming { action, data } => {
                    let base = Self::base(&self.cfg.streaming_url, "streaming")?;
                    self.post(format!("{base}/emit/{action}"), data.as_ref().unwrap_or(&Value::Null)).await
                }
                DeviceOp::CameraPreset { camera, preset } => {
                    let host = self.cfg.cameras.get(camera)
                        .ok_or_else(|| anyhow!("Unknown camera: {camera}"))?;
                    self.get(format!("http://{host}/cgi-bin/ptzctrl.cgi?ptzcmd&poscall&{preset}")).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_reports_configured_states_and_records_calls() {
        let mut states = BTreeMap::new();
        states.insert("switch.hall".to_string(), "off".to_string());
        let mock = MockBackend::new(states);

        let r = mock.perform(&DeviceOp::HaState { entity: "switch.hall".into() }).await.unwrap();
        assert_eq!(r.state.as_deref(), Some("off"));
        let r = mock.perform(&DeviceOp::HaState { entity: "switch.nope".into() }).await.unwrap();
        assert_eq!(r.state.as_deref(), Some("on"));
        let r = mock.perform(&DeviceOp::MixerScene { scene: 3 }).await.unwrap();
        assert!(r.is_success());

        assert_eq!(mock.performed().len(), 3);
        assert_eq!(mock.performed()[2].family(), "mixer");
    }

    #[tokio::test]
    async fn mock_refuses_unconfigured_projectors_and_cameras() {
        let mut devices = DevicesCfg::default();
        devices.projectors.insert("left".into(), "10.0.0.21".into());
        devices.cameras.insert("pulpit".into(), "10.0.0.31".into());
        let mock = MockBackend::default().with_devices(&devices);

        let power = |p: &str| DeviceOp::ProjectorPower { projector: p.into(), state: OnOff::On };
        let preset = |c: &str| DeviceOp::CameraPreset { camera: c.into(), preset: 2 };

        assert!(mock.perform(&power("left")).await.unwrap().is_success());
        let r = mock.perform(&power("right")).await.unwrap();
        assert_eq!((r.status, r.error.as_deref()), (404, Some("Unknown projector: right")));

        assert!(mock.perform(&preset("pulpit")).await.unwrap().is_success());
        let r = mock.perform(&preset("balcony")).await.unwrap();
        assert_eq!((r.status, r.error.as_deref()), (404, Some("Unknown camera: balcony")));

        let all = DeviceOp::ProjectorPowerAll { state: OnOff::Off };
        assert!(mock.perform(&all).await.unwrap().is_success());
    }
}
