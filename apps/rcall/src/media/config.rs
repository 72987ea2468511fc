use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Peer-connection settings for one call.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Gather relay candidates only
    pub relay_only: bool,
    pub audio: bool,
    pub video: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            relay_only: false,
            audio: true,
            video: true,
        }
    }
}

impl EngineConfig {
    /// Host candidates only, no STUN/TURN.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_transport_policy: if self.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

pub struct EngineConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    relay_only: bool,
    audio: bool,
    video: bool,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            ice_servers: vec![],
            relay_only: false,
            audio: true,
            video: true,
        }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn relay_only(mut self, relay_only: bool) -> Self {
        self.relay_only = relay_only;
        self
    }

    pub fn audio(mut self, enabled: bool) -> Self {
        self.audio = enabled;
        self
    }

    pub fn video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    pub fn build(self) -> EngineConfig {
        EngineConfig {
            ice_servers: self.ice_servers,
            relay_only: self.relay_only,
            audio: self.audio,
            video: self.video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_public_stun() {
        let config = EngineConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(config.audio && config.video);
    }

    #[test]
    fn builder_keeps_turn_credentials() {
        let config = EngineConfig::builder()
            .add_ice_server(vec![DEFAULT_STUN_URL.into()])
            .add_ice_server_with_credentials(
                vec!["turn:turn.example.org:3478".into()],
                "user".into(),
                "secret".into(),
            )
            .relay_only(true)
            .video(false)
            .build();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "user");
        assert_eq!(config.ice_servers[1].credential, "secret");
        assert!(!config.video);

        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(rtc.bundle_policy, RTCBundlePolicy::MaxBundle);
    }
}
