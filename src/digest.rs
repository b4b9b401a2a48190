use crate::error::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;

/// Digest of contents
///
/// Digest is defined in [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as a string satisfies following EBNF:
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// algorithm             ::= algorithm-component (algorithm-separator algorithm-component)*
/// algorithm-component   ::= [a-z0-9]+
/// algorithm-separator   ::= [+._-]
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

lazy_static::lazy_static! {
    static ref ALGORITHM_RE: Regex = Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").unwrap();
    static ref ENCODED_RE: Regex = Regex::new(r"^[a-zA-Z0-9=_-]+$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        Digest::new(input)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        match input.split_once(':') {
            Some((algorithm, encoded))
                if ALGORITHM_RE.is_match(algorithm) && ENCODED_RE.is_match(encoded) =>
            {
                Ok(Digest {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }

    /// Calc digest using SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        let digest = base16ct::lower::encode_string(&hash);
        Self {
            algorithm: "sha256".to_string(),
            encoded: digest,
        }
    }

    /// Check `buf` hashes to this digest
    ///
    /// `sha256` and `sha512` are supported.
    pub fn verify(&self, buf: &[u8]) -> Result<()> {
        let encoded = match self.algorithm.as_str() {
            "sha256" => base16ct::lower::encode_string(&Sha256::digest(buf)),
            "sha512" => base16ct::lower::encode_string(&Sha512::digest(buf)),
            _ => return Err(Error::UnsupportedDigestAlgorithm(self.algorithm.clone())),
        };
        if encoded == self.encoded {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: self.clone(),
                actual: Digest {
                    algorithm: self.algorithm.clone(),
                    encoded,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() -> Result<()> {
        let digest = Digest::new(
            "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
        )?;
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(
            digest.encoded,
            "e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f"
        );

        assert!(Digest::new("sha256").is_err());
        assert!(Digest::new("sha256:").is_err());
        assert!(Digest::new("SHA256:abcd").is_err());
        assert!(Digest::new("sha256:ab cd").is_err());
        Ok(())
    }

    #[test]
    fn sha256() -> Result<()> {
        // echo -n "" | sha256sum
        let digest = Digest::from_buf_sha256(b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        digest.verify(b"")?;
        assert!(matches!(
            digest.verify(b"x"),
            Err(Error::DigestMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn sha512() -> Result<()> {
        // echo -n "abc" | sha512sum
        let digest = Digest::new("sha512:ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f")?;
        digest.verify(b"abc")?;

        let forged = Digest::new(&format!("sha512:{}", "0".repeat(128)))?;
        match forged.verify(b"evil") {
            Err(Error::DigestMismatch { expected, actual }) => {
                assert_eq!(expected, forged);
                assert_eq!(actual.algorithm, "sha512");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn unknown_algorithm() -> Result<()> {
        let digest = Digest::new("md5:900150983cd24fb0d6963f7d28e17f72")?;
        assert!(matches!(
            digest.verify(b"abc"),
            Err(Error::UnsupportedDigestAlgorithm(algorithm)) if algorithm == "md5"
        ));
        Ok(())
    }

    #[test]
    fn serde() -> Result<()> {
        let digest = Digest::from_buf_sha256(b"test");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"invalid\"").is_err());
        Ok(())
    }
}
