use std::str::FromStr;

use crate::error::Error;

/// CNI schema versions this plugin can speak, both on its own stdin/stdout
/// and when translating delegate results.
pub const SUPPORTED_VERSIONS: [&str; 5] = ["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0"];

/// Version reported for VERSION when the caller's config carries none.
pub const DEFAULT_VERSION: &str = "0.4.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32, pub u32);

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, Error> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| Error::UnsupportedVersion(s.to_string()))
        };
        let v = Version(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(Error::UnsupportedVersion(s.to_string()));
        }
        Ok(v)
    }
}

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// The 0.1.0/0.2.0 result schema family (ip4/ip6 shaped results).
pub fn is_legacy(version: &str) -> bool {
    version == "0.1.0" || version == "0.2.0"
}

/// CHECK only exists from 0.4.0 on.
pub fn supports_check(version: &str) -> bool {
    match Version::from_str(version) {
        Ok(v) => v >= Version(0, 4, 0),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_order() {
        let v = Version::from_str("0.3.1").unwrap();
        assert_eq!(v, Version(0, 3, 1));
        assert!(Version::from_str("0.4.0").unwrap() > v);
        assert!(Version::from_str("1.0").is_err());
        assert!(Version::from_str("0.4.x").is_err());
    }

    #[test]
    fn check_gating() {
        assert!(supports_check("0.4.0"));
        assert!(supports_check("1.0.0"));
        assert!(!supports_check("0.3.1"));
        assert!(!supports_check("0.2.0"));
        assert!(!supports_check("bogus"));
    }

    #[test]
    fn supported_set() {
        assert!(is_supported("0.2.0"));
        assert!(!is_supported("1.0.0"));
        assert!(is_legacy("0.1.0"));
        assert!(!is_legacy("0.3.0"));
    }
}
