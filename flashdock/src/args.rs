//! Flashing tool arguments: chip targets, `flash_args` discovery and
//! argument vector construction.
//!
//! The build system writes a `flash_args` manifest listing image files and
//! their offsets. The tool reads it through its indirect-argument syntax
//! (`@flash_args`), and the relative paths inside it resolve against the
//! directory the manifest lives in.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// File name of the argument manifest.
pub const FLASH_ARGS_FILE: &str = "flash_args";

/// Program name placed in `argv[0]`.
pub const TOOL_PROGRAM: &str = "esptool";

/// Baud rates offered for flashing.
pub const FLASH_BAUDS: &[u32] = &[115_200, 460_800, 921_600];

/// Default flashing baud rate.
pub const DEFAULT_FLASH_BAUD: u32 = 460_800;

/// Baud rates offered for the serial monitor.
pub const MONITOR_BAUDS: &[u32] = &[9_600, 57_600, 74_880, 115_200, 230_400, 460_800, 921_600];

/// Default monitor baud rate.
pub const DEFAULT_MONITOR_BAUD: u32 = 115_200;

/// Supported chip targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Chip {
    /// Let the tool detect the chip.
    Auto,
    /// ESP32.
    #[default]
    Esp32,
    /// ESP32-S2.
    Esp32s2,
    /// ESP32-S3.
    Esp32s3,
    /// ESP32-C3.
    Esp32c3,
    /// ESP32-C2.
    Esp32c2,
    /// ESP32-C6.
    Esp32c6,
    /// ESP32-H2.
    Esp32h2,
}

impl Chip {
    /// All chip targets, in display order.
    pub const ALL: [Self; 8] = [
        Self::Auto,
        Self::Esp32,
        Self::Esp32s2,
        Self::Esp32s3,
        Self::Esp32c3,
        Self::Esp32c2,
        Self::Esp32c6,
        Self::Esp32h2,
    ];

    /// The name the flashing tool expects after `--chip`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Esp32 => "esp32",
            Self::Esp32s2 => "esp32s2",
            Self::Esp32s3 => "esp32s3",
            Self::Esp32c3 => "esp32c3",
            Self::Esp32c2 => "esp32c2",
            Self::Esp32c6 => "esp32c6",
            Self::Esp32h2 => "esp32h2",
        }
    }

    /// The next chip target, wrapping around.
    #[must_use]
    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|c| *c == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chip {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "");
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| Error::InvalidValue(format!("unknown chip '{s}'")))
    }
}

/// A discovered argument manifest and the directory to run the tool in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashArgs {
    /// Full path of the manifest.
    pub path: PathBuf,
    /// Directory containing the manifest.
    pub working_dir: PathBuf,
}

impl FlashArgs {
    /// The manifest reference understood by the tool's argument parser.
    pub fn indirect_arg(&self) -> String {
        let name = self
            .path
            .file_name()
            .map_or_else(|| FLASH_ARGS_FILE.into(), |n| n.to_string_lossy());
        format!("@{name}")
    }
}

/// Candidate manifest locations for `dir`, in lookup order.
///
/// `dir` may be either a build folder or a project root.
pub fn flash_args_candidates(dir: &Path) -> [PathBuf; 2] {
    [
        dir.join(FLASH_ARGS_FILE),
        dir.join("build").join(FLASH_ARGS_FILE),
    ]
}

/// Locate the argument manifest below `dir`.
pub fn find_flash_args(dir: &Path) -> Result<FlashArgs> {
    let base = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let checked = flash_args_candidates(&base);

    for candidate in &checked {
        if candidate.is_file() {
            log::debug!("Using argument file {}", candidate.display());
            let working_dir = candidate
                .parent()
                .map_or_else(|| base.clone(), Path::to_path_buf);
            return Ok(FlashArgs {
                path: candidate.clone(),
                working_dir,
            });
        }
    }

    Err(Error::FlashArgsNotFound { checked })
}

/// A flashing tool subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Write the images listed in an argument manifest.
    WriteFlash(FlashArgs),
    /// Erase the whole flash.
    EraseFlash,
    /// Read the factory MAC address.
    ReadMac,
}

impl Operation {
    /// Short label used in log banners.
    pub fn label(&self) -> &'static str {
        match self {
            Self::WriteFlash(_) => "FLASH",
            Self::EraseFlash => "ERASE FLASH",
            Self::ReadMac => "READ MAC",
        }
    }

    /// The subcommand name.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::WriteFlash(_) => "write-flash",
            Self::EraseFlash => "erase-flash",
            Self::ReadMac => "read-mac",
        }
    }

    /// Whether `--baud` is passed for this operation.
    pub fn uses_baud(&self) -> bool {
        !matches!(self, Self::ReadMac)
    }
}

/// Everything needed to run the tool once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Argument vector, program name first.
    pub argv: Vec<String>,
    /// Directory the tool runs in.
    pub working_dir: PathBuf,
}

/// Build the argument vector for `operation`.
///
/// `cwd` is used for operations that do not read a manifest.
pub fn build_invocation(
    chip: Chip,
    port: &str,
    baud: Option<u32>,
    operation: &Operation,
    cwd: &Path,
) -> ToolInvocation {
    let mut argv = vec![
        TOOL_PROGRAM.to_string(),
        "--chip".to_string(),
        chip.as_str().to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if operation.uses_baud() {
        if let Some(baud) = baud {
            argv.push("--baud".to_string());
            argv.push(baud.to_string());
        }
    }

    argv.push(operation.subcommand().to_string());

    let working_dir = match operation {
        Operation::WriteFlash(args) => {
            argv.push(args.indirect_arg());
            args.working_dir.clone()
        },
        Operation::EraseFlash | Operation::ReadMac => cwd.to_path_buf(),
    };

    ToolInvocation { argv, working_dir }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_chip_from_str() {
        assert_eq!("esp32c3".parse::<Chip>().unwrap(), Chip::Esp32c3);
        assert_eq!("ESP32-S3".parse::<Chip>().unwrap(), Chip::Esp32s3);
        assert_eq!(" auto ".parse::<Chip>().unwrap(), Chip::Auto);
        assert!("esp8266".parse::<Chip>().is_err());
    }

    #[test]
    fn test_chip_next_wraps() {
        assert_eq!(Chip::Auto.next(), Chip::Esp32);
        assert_eq!(Chip::Esp32h2.next(), Chip::Auto);
    }

    #[test]
    fn test_find_flash_args_in_build_subdir() {
        let dir = tempdir().unwrap();
        let build = dir.path().join("build");
        fs::create_dir(&build).unwrap();
        fs::write(build.join("flash_args"), "--flash_mode dio\n").unwrap();

        let found = find_flash_args(dir.path()).unwrap();
        assert_eq!(found.path, build.canonicalize().unwrap().join("flash_args"));
        assert_eq!(found.working_dir, build.canonicalize().unwrap());
    }

    #[test]
    fn test_find_flash_args_in_dir_itself() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("flash_args"), "").unwrap();

        let found = find_flash_args(dir.path()).unwrap();
        let base = dir.path().canonicalize().unwrap();
        assert_eq!(found.path, base.join("flash_args"));
        assert_eq!(found.working_dir, base);
    }

    #[test]
    fn test_find_flash_args_prefers_dir_over_build() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build").join("flash_args"), "").unwrap();
        fs::write(dir.path().join("flash_args"), "").unwrap();

        let found = find_flash_args(dir.path()).unwrap();
        assert_eq!(found.working_dir, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_find_flash_args_ignores_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("flash_args")).unwrap();

        assert!(matches!(
            find_flash_args(dir.path()),
            Err(Error::FlashArgsNotFound { .. })
        ));
    }

    #[test]
    fn test_find_flash_args_missing_names_both_candidates() {
        let dir = tempdir().unwrap();
        let err = find_flash_args(dir.path()).unwrap_err();

        let base = dir.path().canonicalize().unwrap();
        match &err {
            Error::FlashArgsNotFound { checked } => {
                assert_eq!(checked[0], base.join("flash_args"));
                assert_eq!(checked[1], base.join("build").join("flash_args"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains(&base.join("flash_args").display().to_string()));
        assert!(msg.contains(&base.join("build").join("flash_args").display().to_string()));
    }

    #[test]
    fn test_build_write_flash_invocation() {
        let args = FlashArgs {
            path: PathBuf::from("/proj/build/flash_args"),
            working_dir: PathBuf::from("/proj/build"),
        };
        let inv = build_invocation(
            Chip::Esp32s3,
            "/dev/ttyUSB0",
            Some(460_800),
            &Operation::WriteFlash(args),
            Path::new("/elsewhere"),
        );
        assert_eq!(
            inv.argv,
            [
                "esptool",
                "--chip",
                "esp32s3",
                "--port",
                "/dev/ttyUSB0",
                "--baud",
                "460800",
                "write-flash",
                "@flash_args"
            ]
        );
        assert_eq!(inv.working_dir, PathBuf::from("/proj/build"));
    }

    #[test]
    fn test_build_erase_invocation_without_baud() {
        let inv = build_invocation(
            Chip::Esp32,
            "COM3",
            None,
            &Operation::EraseFlash,
            Path::new("/cwd"),
        );
        assert_eq!(
            inv.argv,
            ["esptool", "--chip", "esp32", "--port", "COM3", "erase-flash"]
        );
        assert_eq!(inv.working_dir, PathBuf::from("/cwd"));
    }

    #[test]
    fn test_build_read_mac_never_passes_baud() {
        let inv = build_invocation(
            Chip::Auto,
            "COM3",
            Some(921_600),
            &Operation::ReadMac,
            Path::new("/cwd"),
        );
        assert_eq!(
            inv.argv,
            ["esptool", "--chip", "auto", "--port", "COM3", "read-mac"]
        );
    }
}
