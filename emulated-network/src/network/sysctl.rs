//! Kernel parameters of a node, as exposed through `sysctl`

use crate::transport::tcp::congestion::CongestionAlgorithm;

pub const IP_FORWARD: &str = "net.ipv4.ip_forward";
pub const TCP_CONGESTION_CONTROL: &str = "net.ipv4.tcp_congestion_control";
const TCP_AVAILABLE_CONGESTION_CONTROL: &str = "net.ipv4.tcp_available_congestion_control";
const TCP_ALLOWED_CONGESTION_CONTROL: &str = "net.ipv4.tcp_allowed_congestion_control";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SysctlError {
    #[error("sysctl: cannot stat /proc/sys/{0}: No such file or directory")]
    UnknownKey(String),
    #[error("sysctl: setting key \"{0}\": Invalid argument")]
    InvalidValue(String),
    #[error("sysctl: permission denied on key \"{0}\"")]
    ReadOnly(String),
}

#[derive(Clone, Debug)]
pub struct Sysctls {
    pub ip_forward: bool,
    pub congestion_control: CongestionAlgorithm,
}

impl Sysctls {
    pub fn new(congestion_control: CongestionAlgorithm) -> Self {
        Self {
            ip_forward: false,
            congestion_control,
        }
    }

    /// All known keys, in the order `sysctl -a` prints them
    pub fn keys() -> [&'static str; 4] {
        [
            IP_FORWARD,
            TCP_ALLOWED_CONGESTION_CONTROL,
            TCP_AVAILABLE_CONGESTION_CONTROL,
            TCP_CONGESTION_CONTROL,
        ]
    }

    pub fn get(&self, key: &str) -> Result<String, SysctlError> {
        let key = normalize(key);
        match key.as_str() {
            IP_FORWARD => Ok(u8::from(self.ip_forward).to_string()),
            TCP_CONGESTION_CONTROL => Ok(self.congestion_control.to_string()),
            TCP_AVAILABLE_CONGESTION_CONTROL | TCP_ALLOWED_CONGESTION_CONTROL => {
                Ok(CongestionAlgorithm::ALL.map(|algo| algo.to_string()).join(" "))
            }
            _ => Err(SysctlError::UnknownKey(key.replace('.', "/"))),
        }
    }

    /// Updates a key, returning the value as it will be read back
    pub fn set(&mut self, key: &str, value: &str) -> Result<String, SysctlError> {
        let key = normalize(key);
        let value = value.trim();
        match key.as_str() {
            IP_FORWARD => {
                self.ip_forward = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(SysctlError::InvalidValue(key)),
                };
            }
            TCP_CONGESTION_CONTROL => {
                self.congestion_control = value
                    .parse()
                    .map_err(|_| SysctlError::InvalidValue(key.clone()))?;
            }
            TCP_AVAILABLE_CONGESTION_CONTROL | TCP_ALLOWED_CONGESTION_CONTROL => {
                return Err(SysctlError::ReadOnly(key));
            }
            _ => return Err(SysctlError::UnknownKey(key.replace('.', "/"))),
        }

        self.get(&key)
    }
}

fn normalize(key: &str) -> String {
    key.trim().replace('/', ".")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_and_set() {
        let mut sysctls = Sysctls::new(CongestionAlgorithm::Cubic);
        assert_eq!(sysctls.get(IP_FORWARD).unwrap(), "0");
        assert_eq!(sysctls.set("net/ipv4/ip_forward", "1").unwrap(), "1");
        assert!(sysctls.ip_forward);

        assert_eq!(
            sysctls.set(TCP_CONGESTION_CONTROL, "reno").unwrap(),
            "reno"
        );
        assert_eq!(
            sysctls
                .get("net.ipv4.tcp_available_congestion_control")
                .unwrap(),
            "reno cubic"
        );
    }

    #[test]
    fn test_errors_match_procps() {
        let mut sysctls = Sysctls::new(CongestionAlgorithm::Cubic);
        assert_eq!(
            sysctls.get("net.ipv4.bogus").unwrap_err().to_string(),
            "sysctl: cannot stat /proc/sys/net/ipv4/bogus: No such file or directory"
        );
        assert_eq!(
            sysctls.set(IP_FORWARD, "2").unwrap_err().to_string(),
            "sysctl: setting key \"net.ipv4.ip_forward\": Invalid argument"
        );
        assert_eq!(
            sysctls.set(TCP_CONGESTION_CONTROL, "bbr").unwrap_err(),
            SysctlError::InvalidValue(TCP_CONGESTION_CONTROL.to_string())
        );
    }
}
