/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Module arguments (section 6) and the tuning constants referenced throughout
//! the ingest/drift-compensation path.

use crate::error::{ConfigError, ConfigResult};
use std::{net::IpAddr, time::Duration};

pub const SAP_PORT: u16 = 9875;
pub const DEFAULT_SAP_ADDRESS: &str = "224.0.0.56";
pub const MAX_SESSIONS: usize = 16;
pub const DEATH_TIMEOUT: Duration = Duration::from_secs(20);
pub const RATE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
pub const RATE_FIX_CAP_FRACTION: f64 = 0.20;
pub const JITTER_QUEUE_CAPACITY: usize = 40 * 1024 * 1024;
/// Default target buffer fill (section 3, `intended_latency_us`) before any
/// sink-latency clamp is applied.
pub const DEFAULT_INTENDED_LATENCY_US: u64 = 200_000;

/// Parsed module arguments (`sink=foo,sap_address=239.1.1.1`).
#[derive(Debug, Clone)]
pub struct ModuleArgs {
    pub sink: String,
    pub sap_address: IpAddr,
}

impl ModuleArgs {
    /// Parses a PulseAudio-style `key=value` argument string, comma- or
    /// whitespace-separated. `sink` is mandatory; `sap_address` defaults to
    /// [`DEFAULT_SAP_ADDRESS`].
    pub fn parse(args: &str) -> ConfigResult<Self> {
        let mut sink = None;
        let mut sap_address = None;

        for pair in args.split([',', ' ']).filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: pair.to_owned(),
                value: String::new(),
            })?;
            match key {
                "sink" => sink = Some(value.to_owned()),
                "sap_address" => sap_address = Some(value.to_owned()),
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: other.to_owned(),
                        value: value.to_owned(),
                    });
                }
            }
        }

        Self::from_parts(sink, sap_address)
    }

    pub fn from_parts(sink: Option<String>, sap_address: Option<String>) -> ConfigResult<Self> {
        let sink = sink
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingArgument("sink"))?;

        let sap_address = match sap_address {
            Some(addr) => addr.trim_matches(['[', ']']).parse()?,
            None => DEFAULT_SAP_ADDRESS
                .parse()
                .expect("default SAP address is a valid literal"),
        };

        if !is_multicast(sap_address) {
            return Err(ConfigError::NotMulticast(sap_address));
        }

        Ok(Self { sink, sap_address })
    }
}

fn is_multicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sink_and_default_sap_address() {
        let args = ModuleArgs::parse("sink=alsa_output.default").expect("should parse");
        assert_eq!(args.sink, "alsa_output.default");
        assert_eq!(args.sap_address, DEFAULT_SAP_ADDRESS.parse::<IpAddr>().expect("literal"));
    }

    #[test]
    fn parses_explicit_ipv6_sap_address() {
        let args = ModuleArgs::parse("sink=foo,sap_address=[ff0e::56]").expect("should parse");
        assert_eq!(args.sap_address, "ff0e::56".parse::<IpAddr>().expect("literal"));
    }

    #[test]
    fn missing_sink_is_a_config_error() {
        let err = ModuleArgs::parse("sap_address=224.0.0.56").unwrap_err();
        assert!(matches!(err, ConfigError::MissingArgument("sink")));
    }

    #[test]
    fn unicast_sap_address_is_rejected() {
        let err = ModuleArgs::parse("sink=foo,sap_address=10.0.0.1").unwrap_err();
        assert!(matches!(err, ConfigError::NotMulticast(_)));
    }
}
