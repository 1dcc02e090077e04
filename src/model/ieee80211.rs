//! 802.11abg MAC model with DCF channel access.

use super::RadioModel;

pub struct Ieee80211Abg;

const MAC_OPTIONS: [(&str, &str); 10] = [
    ("mode", "0"),
    ("distance", "1000"),
    ("unicastrate", "4"),
    ("multicastrate", "1"),
    ("rtsthreshold", "0"),
    ("wmmenable", "0"),
    ("enablepromiscuousmode", "0"),
    ("flowcontrolenable", "0"),
    ("flowcontroltokens", "10"),
    ("pcrcurveuri", "ieee80211pcr.xml"),
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

impl RadioModel for Ieee80211Abg {
    fn name(&self) -> &'static str {
        "ieee80211abg"
    }

    fn mac_definition(&self) -> &'static str {
        "ieee80211abgmaclayer.xml"
    }

    fn mac_options(&self) -> &'static [(&'static str, &'static str)] {
        &MAC_OPTIONS
    }

    fn phy_options(&self) -> &'static [(&'static str, &'static str)] {
        &PHY_OPTIONS
    }
}
