//! Named-port directory for flow-based components.
//!
//! A component declares the in- and out-ports it expects as `(id, name)`
//! pairs, then feeds the connector a wiring description: either a streamed
//! `PortInfos` message or a TOML `[ports]` document. The connector resolves
//! each named sturdy ref to a live endpoint and answers `in_port(id)` /
//! `out_port(id)` lookups afterwards. Resolution failures never abort a
//! connect pass; they leave the individual port disconnected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Reader, Writer};
use crate::config::{OutPortEntry, PortsConfig};
use crate::msg::Msg;
use crate::restorer::{Cap, RestoreError, Restorer};

/// Component-local port identifier.
pub type PortId = u32;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("empty sturdy ref")]
    EmptySturdyRef,

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("capability is not a {expected}")]
    WrongCapType { expected: &'static str },
}

/// Resolves sturdy refs to endpoint capabilities.
///
/// This wraps whatever restorer the process was bootstrapped with; a remote
/// deployment would substitute the RPC-backed restorer here.
#[derive(Clone)]
pub struct ConnectionManager {
    restorer: Arc<dyn Restorer>,
}

impl ConnectionManager {
    pub fn new(restorer: Arc<dyn Restorer>) -> Self {
        Self { restorer }
    }

    pub fn try_connect(&self, sr: &str) -> Result<Cap, ConnectError> {
        if sr.is_empty() {
            return Err(ConnectError::EmptySturdyRef);
        }
        Ok(self.restorer.restore(sr)?)
    }

    pub fn connect_reader(&self, sr: &str) -> Result<Reader, ConnectError> {
        self.try_connect(sr)?
            .into_reader()
            .ok_or(ConnectError::WrongCapType { expected: "reader" })
    }

    pub fn connect_writer(&self, sr: &str) -> Result<Writer, ConnectError> {
        self.try_connect(sr)?
            .into_writer()
            .ok_or(ConnectError::WrongCapType { expected: "writer" })
    }
}

/// Streamed wiring description: one message on a one-shot channel.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortInfos {
    #[serde(default)]
    pub in_ports: Vec<InPortInfo>,
    #[serde(default)]
    pub out_ports: Vec<OutPortInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InPortInfo {
    pub name: String,
    pub sr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutPortInfo {
    pub name: String,
    /// Scalar out port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr: Option<String>,
    /// Array out port: one writer per sturdy ref, in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<Vec<String>>,
}

/// Live map from declared port names to channel endpoints.
pub struct PortConnector {
    conman: ConnectionManager,
    in_caps: HashMap<PortId, Reader>,
    in_name_to_id: HashMap<String, PortId>,
    in_connected: HashMap<PortId, bool>,
    out_caps: HashMap<PortId, Writer>,
    arr_out_caps: HashMap<PortId, Vec<Writer>>,
    out_name_to_id: HashMap<String, PortId>,
    out_id_to_name: HashMap<PortId, String>,
    out_connected: HashMap<PortId, bool>,
    arr_out_connected: HashMap<PortId, Vec<bool>>,
}

impl PortConnector {
    pub fn new(
        conman: ConnectionManager,
        in_ports: &[(PortId, &str)],
        out_ports: &[(PortId, &str)],
    ) -> Self {
        let mut connector = Self {
            conman,
            in_caps: HashMap::new(),
            in_name_to_id: HashMap::new(),
            in_connected: HashMap::new(),
            out_caps: HashMap::new(),
            arr_out_caps: HashMap::new(),
            out_name_to_id: HashMap::new(),
            out_id_to_name: HashMap::new(),
            out_connected: HashMap::new(),
            arr_out_connected: HashMap::new(),
        };
        for &(port_id, name) in in_ports {
            connector.in_name_to_id.insert(name.to_string(), port_id);
            connector.in_connected.insert(port_id, false);
        }
        for &(port_id, name) in out_ports {
            connector.out_name_to_id.insert(name.to_string(), port_id);
            connector.out_id_to_name.insert(port_id, name.to_string());
            connector.out_connected.insert(port_id, false);
        }
        connector
    }

    /// Wire ports from a one-shot channel carrying a JSON `PortInfos` value.
    pub fn connect_from_port_infos(&mut self, port_infos_reader_sr: &str) {
        let Some(payload) = self.read_one_shot(port_infos_reader_sr) else {
            return;
        };
        let infos: PortInfos = match serde_json::from_slice(&payload) {
            Ok(infos) => infos,
            Err(err) => {
                tracing::error!(%err, "malformed port infos, no ports connected");
                return;
            }
        };
        self.apply_port_infos(infos);
    }

    /// Wire ports from a one-shot channel carrying a TOML `[ports]` document.
    pub fn connect_from_config(&mut self, config_reader_sr: &str) {
        let Some(payload) = self.read_one_shot(config_reader_sr) else {
            return;
        };
        let text = match std::str::from_utf8(&payload) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(%err, "ports config is not UTF-8, no ports connected");
                return;
            }
        };
        self.connect_from_config_str(text);
    }

    pub fn connect_from_config_str(&mut self, contents: &str) {
        let config = match PortsConfig::from_str(contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(%err, "malformed ports config, no ports connected");
                return;
            }
        };
        self.apply_config(config);
    }

    pub fn connect_from_config_file(&mut self, path: &Path) {
        let config = match PortsConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(%err, "cannot load ports config, no ports connected");
                return;
            }
        };
        self.apply_config(config);
    }

    fn read_one_shot(&self, sr: &str) -> Option<bytes::Bytes> {
        let reader = match self.conman.connect_reader(sr) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(%err, "cannot open wiring channel");
                return None;
            }
        };
        match reader.read() {
            Ok(Msg::Value(payload)) => Some(payload),
            Ok(Msg::Done) => {
                tracing::debug!("wiring channel closed without a message");
                None
            }
            Err(err) => {
                tracing::warn!(%err, "failed to read wiring channel");
                None
            }
        }
    }

    fn apply_port_infos(&mut self, infos: PortInfos) {
        for entry in infos.in_ports {
            if let Some(&port_id) = self.in_name_to_id.get(&entry.name) {
                self.connect_in(port_id, &entry.sr);
            }
        }
        for entry in infos.out_ports {
            let Some(&port_id) = self.out_name_to_id.get(&entry.name) else {
                continue;
            };
            if let Some(srs) = entry.srs {
                for sr in srs {
                    self.connect_arr_out(port_id, &sr);
                }
            } else if let Some(sr) = entry.sr {
                self.connect_out(port_id, &sr);
            }
        }
    }

    fn apply_config(&mut self, config: PortsConfig) {
        for (name, entry) in config.ports.in_ports {
            if let Some(&port_id) = self.in_name_to_id.get(&name) {
                self.connect_in(port_id, &entry.sr);
            }
        }
        for (name, entry) in config.ports.out_ports {
            let Some(&port_id) = self.out_name_to_id.get(&name) else {
                continue;
            };
            match entry {
                OutPortEntry::Scalar(entry) => self.connect_out(port_id, &entry.sr),
                OutPortEntry::Array(entries) => {
                    for entry in entries {
                        self.connect_arr_out(port_id, &entry.sr);
                    }
                }
            }
        }
    }

    fn connect_in(&mut self, port_id: PortId, sr: &str) {
        match self.conman.connect_reader(sr) {
            Ok(reader) => {
                self.in_caps.insert(port_id, reader);
                self.in_connected.insert(port_id, true);
            }
            Err(err) => {
                tracing::warn!(port_id, %err, "in port left disconnected");
                self.in_connected.insert(port_id, false);
            }
        }
    }

    fn connect_out(&mut self, port_id: PortId, sr: &str) {
        match self.conman.connect_writer(sr) {
            Ok(writer) => {
                self.out_caps.insert(port_id, writer);
                self.out_connected.insert(port_id, true);
            }
            Err(err) => {
                tracing::warn!(port_id, %err, "out port left disconnected");
                self.out_connected.insert(port_id, false);
            }
        }
    }

    fn connect_arr_out(&mut self, port_id: PortId, sr: &str) {
        match self.conman.connect_writer(sr) {
            Ok(writer) => {
                self.arr_out_caps.entry(port_id).or_default().push(writer);
                self.arr_out_connected
                    .entry(port_id)
                    .or_default()
                    .push(true);
            }
            Err(err) => {
                tracing::warn!(port_id, %err, "array out slot left disconnected");
            }
        }
    }

    pub fn in_port(&self, port_id: PortId) -> Option<Reader> {
        self.in_caps.get(&port_id).cloned()
    }

    pub fn out_port(&self, port_id: PortId) -> Option<Writer> {
        self.out_caps.get(&port_id).cloned()
    }

    pub fn arr_out(&self, port_id: PortId, index: usize) -> Option<Writer> {
        self.arr_out_caps
            .get(&port_id)
            .and_then(|writers| writers.get(index))
            .cloned()
    }

    pub fn arr_out_len(&self, port_id: PortId) -> usize {
        self.arr_out_caps
            .get(&port_id)
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub fn is_in_connected(&self, port_id: PortId) -> bool {
        self.in_connected.get(&port_id).copied().unwrap_or(false)
    }

    pub fn is_out_connected(&self, port_id: PortId) -> bool {
        self.out_connected.get(&port_id).copied().unwrap_or(false)
    }

    pub fn is_arr_out_connected(&self, port_id: PortId, index: usize) -> bool {
        self.arr_out_connected
            .get(&port_id)
            .and_then(|flags| flags.get(index))
            .copied()
            .unwrap_or(false)
    }

    /// Mark an in port disconnected once its reader has observed `Done`.
    pub fn set_in_disconnected(&mut self, port_id: PortId) {
        self.in_connected.insert(port_id, false);
    }

    /// Send `close` to every connected out endpoint, scalar and array.
    pub fn close_out_ports(&self) {
        for (&port_id, writer) in &self.out_caps {
            if self.is_out_connected(port_id) {
                let name = self
                    .out_id_to_name
                    .get(&port_id)
                    .map(String::as_str)
                    .unwrap_or("?");
                tracing::info!(port = name, "closing OUT port");
                if let Err(err) = writer.close() {
                    tracing::warn!(port = name, %err, "close failed");
                }
            }
        }
        for (&port_id, writers) in &self.arr_out_caps {
            let name = self
                .out_id_to_name
                .get(&port_id)
                .map(String::as_str)
                .unwrap_or("?");
            for (index, writer) in writers.iter().enumerate() {
                if self.is_arr_out_connected(port_id, index) {
                    tracing::info!(port = name, index, "closing OUT port");
                    if let Err(err) = writer.close() {
                        tracing::warn!(port = name, index, %err, "close failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::channel::{ChannelClient, ChannelService, ServiceHandle};
    use crate::restorer::MemRestorer;

    const IN_DATA: PortId = 1;
    const OUT_RESULT: PortId = 2;
    const OUT_FANOUT: PortId = 3;

    struct Rig {
        restorer: Arc<MemRestorer>,
        service: ServiceHandle,
    }

    impl Rig {
        fn new() -> Self {
            let restorer = Arc::new(MemRestorer::new("rig"));
            let service = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
            Self { restorer, service }
        }

        fn conman(&self) -> ConnectionManager {
            ConnectionManager::new(self.restorer.clone())
        }

        fn connector(&self) -> PortConnector {
            PortConnector::new(
                self.conman(),
                &[(IN_DATA, "data")],
                &[(OUT_RESULT, "result"), (OUT_FANOUT, "fanout")],
            )
        }

        /// Channel whose reader is saved under `reader_token` and writer
        /// under `writer_token`.
        fn channel(&self, reader_token: &str, writer_token: &str) -> ChannelClient {
            let channel = self.service.create_channel("chan", "", 4).unwrap();
            let (reader, writer) = channel.endpoints().unwrap();
            reader.save_as(Some(reader_token)).unwrap();
            writer.save_as(Some(writer_token)).unwrap();
            channel
        }

        /// One-shot channel whose single message is `payload`; returns the
        /// sturdy-ref token of its reader.
        fn one_shot(&self, token: &str, payload: &[u8]) -> String {
            let channel = self.service.create_channel("wiring", "", 1).unwrap();
            let (reader, writer) = channel.endpoints().unwrap();
            reader.save_as(Some(token)).unwrap();
            writer.write(Msg::value(payload.to_vec())).unwrap();
            token.to_string()
        }
    }

    #[test]
    fn connects_from_port_infos_message() {
        let rig = Rig::new();
        let _data = rig.channel("data-r", "data-w");
        let _result = rig.channel("result-r", "result-w");
        let _fan_a = rig.channel("fan-a-r", "fan-a-w");
        let _fan_b = rig.channel("fan-b-r", "fan-b-w");

        let infos = PortInfos {
            in_ports: vec![InPortInfo {
                name: "data".into(),
                sr: "data-r".into(),
            }],
            out_ports: vec![
                OutPortInfo {
                    name: "result".into(),
                    sr: Some("result-w".into()),
                    srs: None,
                },
                OutPortInfo {
                    name: "fanout".into(),
                    sr: None,
                    srs: Some(vec!["fan-a-w".into(), "fan-b-w".into()]),
                },
                OutPortInfo {
                    name: "never-declared".into(),
                    sr: Some("result-w".into()),
                    srs: None,
                },
            ],
        };
        let wiring = rig.one_shot("wiring", &serde_json::to_vec(&infos).unwrap());

        let mut connector = rig.connector();
        connector.connect_from_port_infos(&wiring);

        assert!(connector.is_in_connected(IN_DATA));
        assert!(connector.is_out_connected(OUT_RESULT));
        assert_eq!(connector.arr_out_len(OUT_FANOUT), 2);
        assert!(connector.is_arr_out_connected(OUT_FANOUT, 0));
        assert!(connector.is_arr_out_connected(OUT_FANOUT, 1));
        assert!(!connector.is_arr_out_connected(OUT_FANOUT, 2));

        // The resolved endpoints are live: a value pushed through the out
        // port arrives at the channel's reader.
        let result_reader = rig.conman().connect_reader("result-r").unwrap();
        connector
            .out_port(OUT_RESULT)
            .unwrap()
            .write(Msg::value("ping"))
            .unwrap();
        assert_eq!(result_reader.read().unwrap(), Msg::value("ping"));
    }

    #[test]
    fn connects_from_toml_config() {
        let rig = Rig::new();
        let _data = rig.channel("data-r", "data-w");
        let _result = rig.channel("result-r", "result-w");
        let _fan = rig.channel("fan-r", "fan-w");

        let toml = br#"
            [ports.in.data]
            sr = "data-r"

            [ports.out.result]
            sr = "result-w"

            [[ports.out.fanout]]
            sr = "fan-w"

            [ports.out.unknown]
            sr = "result-w"
        "#;
        let wiring = rig.one_shot("wiring", toml);

        let mut connector = rig.connector();
        connector.connect_from_config(&wiring);

        assert!(connector.is_in_connected(IN_DATA));
        assert!(connector.is_out_connected(OUT_RESULT));
        assert_eq!(connector.arr_out_len(OUT_FANOUT), 1);
    }

    #[test]
    fn malformed_config_connects_nothing() {
        let rig = Rig::new();
        let wiring = rig.one_shot("wiring", b"[ports.in\nsr =");

        let mut connector = rig.connector();
        connector.connect_from_config(&wiring);

        assert!(!connector.is_in_connected(IN_DATA));
        assert!(!connector.is_out_connected(OUT_RESULT));
    }

    #[test]
    fn failed_resolution_leaves_only_that_port_disconnected() {
        let rig = Rig::new();
        let _result = rig.channel("result-r", "result-w");

        let mut connector = rig.connector();
        connector.connect_from_config_str(
            r#"
            [ports.in.data]
            sr = "no-such-token"

            [ports.out.result]
            sr = "result-w"
            "#,
        );

        assert!(!connector.is_in_connected(IN_DATA));
        assert!(connector.in_port(IN_DATA).is_none());
        assert!(connector.is_out_connected(OUT_RESULT));
    }

    #[test]
    fn wrong_cap_type_is_a_failed_resolution() {
        let rig = Rig::new();
        let _data = rig.channel("data-r", "data-w");

        let mut connector = rig.connector();
        // The writer token cannot be cast to a reader.
        connector.connect_from_config_str(
            r#"
            [ports.in.data]
            sr = "data-w"
            "#,
        );
        assert!(!connector.is_in_connected(IN_DATA));
    }

    #[test]
    fn close_out_ports_closes_scalar_and_array_writers() {
        let rig = Rig::new();
        let _result = rig.channel("result-r", "result-w");
        let fan = rig.channel("fan-r", "fan-w");

        let mut connector = rig.connector();
        connector.connect_from_config_str(
            r#"
            [ports.out.result]
            sr = "result-w"

            [[ports.out.fanout]]
            sr = "fan-w"
            "#,
        );

        // The port writers are each channel's only writer, so the close
        // propagates Done to the readers under FBP semantics.
        connector.close_out_ports();

        let fan_reader = fan.reader().unwrap();
        drop(fan);
        assert_eq!(fan_reader.read().unwrap(), Msg::Done);

        let result_reader = rig.conman().connect_reader("result-r").unwrap();
        assert_eq!(result_reader.read().unwrap(), Msg::Done);
    }

    #[test]
    fn set_in_disconnected_flips_the_flag_only() {
        let rig = Rig::new();
        let _data = rig.channel("data-r", "data-w");

        let mut connector = rig.connector();
        connector.connect_from_config_str("[ports.in.data]\nsr = \"data-r\"\n");
        assert!(connector.is_in_connected(IN_DATA));

        connector.set_in_disconnected(IN_DATA);
        assert!(!connector.is_in_connected(IN_DATA));
        // The capability itself stays addressable, matching the flag-only
        // disconnect the FBP loop performs on Done.
        assert!(connector.in_port(IN_DATA).is_some());
    }
}
