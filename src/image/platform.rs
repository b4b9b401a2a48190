use crate::error::*;
use oci_spec::image::{Arch, Os, Platform, PlatformBuilder};
use regex::Regex;

const KNOWN_OS: &[&str] = &[
    "aix",
    "android",
    "darwin",
    "dragonfly",
    "freebsd",
    "hurd",
    "illumos",
    "ios",
    "js",
    "linux",
    "nacl",
    "netbsd",
    "openbsd",
    "plan9",
    "solaris",
    "windows",
    "zos",
];

const KNOWN_ARCH: &[&str] = &[
    "386",
    "amd64",
    "amd64p32",
    "arm",
    "armbe",
    "arm64",
    "arm64be",
    "loong64",
    "mips",
    "mipsle",
    "mips64",
    "mips64le",
    "mips64p32",
    "mips64p32le",
    "ppc",
    "ppc64",
    "ppc64le",
    "riscv",
    "riscv64",
    "s390",
    "s390x",
    "sparc",
    "sparc64",
    "wasm",
];

lazy_static::lazy_static! {
    static ref COMPONENT_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

fn normalize_os(os: &str) -> String {
    let os = os.to_lowercase();
    if os == "macos" {
        "darwin".to_string()
    } else {
        os
    }
}

fn normalize_arch(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    match arch.as_str() {
        "i386" => ("386".to_string(), String::new()),
        "x86_64" | "x86-64" | "amd64" => {
            let variant = if variant == "v1" { String::new() } else { variant };
            ("amd64".to_string(), variant)
        }
        "aarch64" | "arm64" => {
            let variant = match variant.as_str() {
                "8" | "v8" => String::new(),
                _ => variant,
            };
            ("arm64".to_string(), variant)
        }
        "armhf" => ("arm".to_string(), "v7".to_string()),
        "armel" => ("arm".to_string(), "v6".to_string()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_string(),
                "5" | "6" | "8" => format!("v{}", variant),
                _ => variant,
            };
            ("arm".to_string(), variant)
        }
        _ => (arch, variant),
    }
}

fn to_arch(architecture: &str) -> Arch {
    // `Arch::from` maps `armbe` to `arm64be`
    match architecture {
        "armbe" => Arch::ARMbe,
        arch => Arch::from(arch),
    }
}

/// Platform handling on top of [oci_spec::image::Platform]
///
/// Empty `os` or `architecture`, i.e. `Os::Other("")`, means unknown,
/// and will be filled from the image configuration if possible.
pub trait PlatformEx: Sized {
    fn from_parts(os: &str, architecture: &str, variant: &str) -> Self;

    /// Neither OS nor architecture is known
    fn unknown() -> Self {
        Self::from_parts("", "", "")
    }

    /// Platform of the running host, used to complete `linux` or `amd64` like specifier
    fn host() -> Self {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH, "").normalize()
    }

    /// Parse `os/arch[/variant]` specifier
    ///
    /// A single component is accepted if it is a known OS or architecture,
    /// and the other is completed by the host platform.
    /// The result is normalized.
    fn parse(specifier: &str) -> Result<Self>;

    /// Canonicalize OS, architecture and variant,
    /// e.g. `x86_64` becomes `amd64`, `aarch64` becomes `arm64`.
    ///
    /// ```
    /// use imagetools::image::{Platform, PlatformEx};
    ///
    /// let p = Platform::from_parts("Linux", "aarch64", "v8").normalize();
    /// assert_eq!(p, Platform::from_parts("linux", "arm64", ""));
    /// ```
    fn normalize(self) -> Self;

    /// `os/arch[/variant]` representation, `unknown` if OS is empty
    fn format(&self) -> String;

    /// Format after normalization, used to match platforms
    fn canonical(&self) -> String;

    /// OS or architecture is unknown
    fn is_incomplete(&self) -> bool;
}

impl PlatformEx for Platform {
    fn from_parts(os: &str, architecture: &str, variant: &str) -> Self {
        let mut builder = PlatformBuilder::default()
            .os(Os::from(os))
            .architecture(to_arch(architecture));
        if !variant.is_empty() {
            builder = builder.variant(variant);
        }
        builder.build().expect("os and architecture are set")
    }

    fn parse(specifier: &str) -> Result<Self> {
        let err = |reason: &str| Error::BadPlatform {
            platform: specifier.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = specifier.split('/').collect();
        if parts.iter().any(|part| !COMPONENT_RE.is_match(part)) {
            return Err(err("invalid platform component"));
        }
        match parts[..] {
            [single] => {
                let host = Self::host();
                let os = normalize_os(single);
                if KNOWN_OS.contains(&os.as_str()) {
                    let mut platform = host;
                    platform.set_os(Os::from(os.as_str()));
                    return Ok(platform);
                }
                let (arch, variant) = normalize_arch(single, "");
                if KNOWN_ARCH.contains(&arch.as_str()) {
                    return Ok(Self::from_parts(&host.os().to_string(), &arch, &variant));
                }
                Err(err("unknown operating system or architecture"))
            }
            [os, arch] => Ok(Self::from_parts(os, arch, "").normalize()),
            [os, arch, variant] => Ok(Self::from_parts(os, arch, variant).normalize()),
            _ => Err(err("too many components")),
        }
    }

    fn normalize(mut self) -> Self {
        let os = normalize_os(&self.os().to_string());
        let (arch, variant) = normalize_arch(
            &self.architecture().to_string(),
            self.variant().as_deref().unwrap_or_default(),
        );
        self.set_os(Os::from(os.as_str()));
        self.set_architecture(to_arch(&arch));
        self.set_variant(if variant.is_empty() {
            None
        } else {
            Some(variant)
        });
        self
    }

    fn format(&self) -> String {
        let os = self.os().to_string();
        if os.is_empty() {
            return "unknown".to_string();
        }
        let arch = self.architecture().to_string();
        let variant = self.variant().clone().unwrap_or_default();
        [os, arch, variant]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn canonical(&self) -> String {
        self.clone().normalize().format()
    }

    fn is_incomplete(&self) -> bool {
        self.os().to_string().is_empty() || self.architecture().to_string().is_empty()
    }
}
