//! Radio propagation models and the registry that owns them.
//!
//! The registry is an explicit value constructed at program start and
//! threaded through the session; it is read-only afterwards. Every model
//! contributes its option defaults and knows how to render the platform
//! definition consumed by its daemon.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::{IfaceKey, NemId, RadioError, Result};

pub mod ieee80211;
pub mod rfpipe;

/// Option name to value, merged over model defaults.
pub type ModelConfig = HashMap<String, String>;

/// Options shared by every platform instance regardless of model.
pub(crate) const PLATFORM_OPTIONS: [(&str, &str); 5] = [
    ("otamanagergroup", "224.0.0.2:45702"),
    ("otamanagerdevice", "ctrl0"),
    ("eventservicegroup", "224.0.0.1:45703"),
    ("eventservicedevice", "ctrl0"),
    ("external", "0"),
];

pub trait RadioModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// MAC layer definition document consumed by the daemon.
    fn mac_definition(&self) -> &'static str;

    /// MAC layer option names with their defaults.
    fn mac_options(&self) -> &'static [(&'static str, &'static str)];

    /// PHY layer option names with their defaults.
    fn phy_options(&self) -> &'static [(&'static str, &'static str)];

    /// Full option set: platform options plus MAC and PHY defaults.
    /// After merging a stored config over this, every recognized option
    /// is present.
    fn default_values(&self) -> ModelConfig {
        PLATFORM_OPTIONS
            .iter()
            .chain(self.mac_options())
            .chain(self.phy_options())
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    /// Render the platform definition for one NEM.
    fn build_platform_xml(
        &self,
        nem_id: NemId,
        nem_port: u16,
        nem_name: &str,
        iface_name: &str,
        config: &ModelConfig,
    ) -> Result<String> {
        build_platform_doc(self, nem_id, nem_port, nem_name, iface_name, config)
    }

    /// Hook invoked for every member interface after session startup.
    fn post_startup(&self, _iface: IfaceKey) -> Result<()> {
        Ok(())
    }
}

/// The set of known radio models, keyed by name.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn RadioModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        ModelRegistry::default()
    }

    /// Registry preloaded with the models this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = ModelRegistry::new();
        registry.register(Arc::new(rfpipe::RfPipe));
        registry.register(Arc::new(ieee80211::Ieee80211Abg));
        registry
    }

    pub fn register(&mut self, model: Arc<dyn RadioModel>) {
        self.models.insert(model.name().to_owned(), model);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RadioModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| RadioError::UnknownModel(name.to_owned()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}

fn xml_err<E>(e: E) -> RadioError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RadioError::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn write_param<W: io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: &str,
) -> Result<()> {
    let mut param = BytesStart::new("param");
    param.push_attribute(("name", name));
    param.push_attribute(("value", value));
    writer.write_event(Event::Empty(param)).map_err(xml_err)
}

fn write_layer<W: io::Write>(
    writer: &mut Writer<W>,
    layer: &str,
    definition: &str,
    options: &[(&str, &str)],
    config: &ModelConfig,
) -> Result<()> {
    let mut start = BytesStart::new(layer);
    start.push_attribute(("definition", definition));
    writer
        .write_event(Event::Start(start))
        .map_err(xml_err)?;
    for &(name, default) in options {
        let value = config.get(name).map(String::as_str).unwrap_or(default);
        write_param(writer, name, value)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(layer)))
        .map_err(xml_err)
}

/// Platform definition shared by all models: the control channel
/// parameters, then one nem element carrying transport, MAC and PHY.
fn build_platform_doc<M: RadioModel + ?Sized>(
    model: &M,
    nem_id: NemId,
    nem_port: u16,
    nem_name: &str,
    iface_name: &str,
    config: &ModelConfig,
) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut platform = BytesStart::new("platform");
    let platform_name = format!("platform-{}", iface_name);
    let id = nem_id.to_string();
    platform.push_attribute(("name", platform_name.as_str()));
    platform.push_attribute(("id", id.as_str()));
    writer
        .write_event(Event::Start(platform))
        .map_err(xml_err)?;

    for &(name, default) in &PLATFORM_OPTIONS {
        if name == "external" {
            continue;
        }
        let value = config.get(name).map(String::as_str).unwrap_or(default);
        write_param(&mut writer, name, value)?;
    }
    let endpoint = format!("localhost:{}", nem_port);
    write_param(&mut writer, "platformendpoint", &endpoint)?;

    let mut nem = BytesStart::new("nem");
    nem.push_attribute(("name", nem_name));
    nem.push_attribute(("id", id.as_str()));
    writer.write_event(Event::Start(nem)).map_err(xml_err)?;

    let mut transport = BytesStart::new("transport");
    transport.push_attribute(("definition", "transvirtual.xml"));
    writer
        .write_event(Event::Start(transport))
        .map_err(xml_err)?;
    write_param(&mut writer, "device", iface_name)?;
    writer
        .write_event(Event::End(BytesEnd::new("transport")))
        .map_err(xml_err)?;

    write_layer(
        &mut writer,
        "mac",
        model.mac_definition(),
        model.mac_options(),
        config,
    )?;
    write_layer(
        &mut writer,
        "phy",
        "universalphy.xml",
        model.phy_options(),
        config,
    )?;

    writer
        .write_event(Event::End(BytesEnd::new("nem")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("platform")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let registry = ModelRegistry::with_defaults();
        assert!(registry.get("rfpipe").is_ok());
        assert!(registry.get("ieee80211abg").is_ok());
        match registry.get("tdma") {
            Err(RadioError::UnknownModel(name)) => assert_eq!(name, "tdma"),
            other => panic!("unexpected: {:?}", other.map(|m| m.name())),
        }
    }

    #[test]
    fn defaults_cover_all_option_levels() {
        let registry = ModelRegistry::with_defaults();
        let model = registry.get("rfpipe").unwrap();
        let defaults = model.default_values();
        assert_eq!(defaults.get("external").map(String::as_str), Some("0"));
        assert_eq!(defaults.get("datarate").map(String::as_str), Some("1M"));
        assert!(defaults.contains_key("otamanagergroup"));
        assert!(defaults.contains_key("bandwidth"));
    }

    #[test]
    fn platform_doc_carries_overrides() {
        let registry = ModelRegistry::with_defaults();
        let model = registry.get("rfpipe").unwrap();
        let mut config = model.default_values();
        config.insert("datarate".to_owned(), "54M".to_owned());
        let doc = model
            .build_platform_xml(3, 47003, "wlan1-eth0", "eth0", &config)
            .unwrap();
        assert!(doc.contains("platform-eth0"));
        assert!(doc.contains("localhost:47003"));
        assert!(doc.contains(r#"name="datarate" value="54M""#));
        assert!(doc.contains(r#"<nem name="wlan1-eth0" id="3">"#));
    }
}
