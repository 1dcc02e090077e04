//! Basic pipe model: fixed datarate with configurable delay and jitter.

use super::RadioModel;

pub struct RfPipe;

const MAC_OPTIONS: [(&str, &str); 8] = [
    ("datarate", "1M"),
    ("delay", "0"),
    ("jitter", "0"),
    ("enablepromiscuousmode", "0"),
    ("flowcontrolenable", "0"),
    ("flowcontroltokens", "10"),
    ("pcrcurveuri", "rfpipepcr.xml"),
    ("radiometricenable", "0"),
];

const PHY_OPTIONS: [(&str, &str); 8] = [
    ("bandwidth", "1M"),
    ("frequency", "2.347G"),
    ("frequencyofinterest", "2.347G"),
    ("fixedantennagain", "0.0"),
    ("fixedantennagainenable", "1"),
    ("noisemode", "none"),
    ("propagationmodel", "2ray"),
    ("txpower", "0.0"),
];

impl RadioModel for RfPipe {
    fn name(&self) -> &'static str {
        "rfpipe"
    }

    fn mac_definition(&self) -> &'static str {
        "rfpipemaclayer.xml"
    }

    fn mac_options(&self) -> &'static [(&'static str, &'static str)] {
        &MAC_OPTIONS
    }

    fn phy_options(&self) -> &'static [(&'static str, &'static str)] {
        &PHY_OPTIONS
    }
}
