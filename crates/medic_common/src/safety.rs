//! Destructive command deny-list for fix execution.
//!
//! Stricter than the diagnostic deny-list in `tools`: fixes are allowed to
//! change the system, but never in ways that destroy disks, the boot chain,
//! or the machine-wide registry. The scan is exhaustive so every violation
//! can be reported at once.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Class of destructive operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestructiveKind {
    DriveFormat,
    SystemDriveDelete,
    MachineRegistryDelete,
    BootConfigEdit,
    DiskPartitioning,
    RawDiskWrite,
}

impl DestructiveKind {
    pub fn describe(&self) -> &'static str {
        match self {
            DestructiveKind::DriveFormat => "formats a drive",
            DestructiveKind::SystemDriveDelete => "recursively deletes the system drive",
            DestructiveKind::MachineRegistryDelete => "deletes machine-wide registry keys",
            DestructiveKind::BootConfigEdit => "edits the boot configuration",
            DestructiveKind::DiskPartitioning => "runs a disk partitioning tool",
            DestructiveKind::RawDiskWrite => "writes directly to a block device",
        }
    }
}

impl std::fmt::Display for DestructiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

static DENY_RULES: Lazy<Vec<(DestructiveKind, Regex)>> = Lazy::new(|| {
    let rules: &[(DestructiveKind, &str)] = &[
        // format C:, Format-Volume, mkfs.ext4 /dev/sda1
        (DestructiveKind::DriveFormat, r"(?i)\bformat(\.com)?\s+[a-z]:"),
        (DestructiveKind::DriveFormat, r"(?i)\bformat-volume\b"),
        (DestructiveKind::DriveFormat, r"(?i)\bclear-disk\b"),
        (DestructiveKind::DriveFormat, r"(?i)\bmkfs(\.\w+)?\b"),
        (DestructiveKind::DriveFormat, r"(?i)\bwipefs\b"),
        // rm -rf /, Remove-Item C:\ -Recurse, rd /s C:\
        (
            DestructiveKind::SystemDriveDelete,
            r"(?i)\brm\s+(-[a-z]*\s+)*-[a-z]*[rR][a-z]*\s+(-[a-z-]+\s+)*[\x22']?(/|/\*|~)[\x22']?(\s|$)",
        ),
        (DestructiveKind::SystemDriveDelete, r"(?i)--no-preserve-root"),
        // Targets: C:, C:\, C:\*, C:\*.*, C:\Windows, $env:SystemDrive\...
        (
            DestructiveKind::SystemDriveDelete,
            r"(?i)\b(remove-item|ri|del|erase|rd|rmdir)\b[^|;&]*(^|[\s\x22'=])(c:|\$env:systemdrive)(\\(\*(\.\*)?|windows(\\system32)?)?\\?)?[\x22']?(\s|$)[^|;&]*(-recurse|/s)\b",
        ),
        (
            DestructiveKind::SystemDriveDelete,
            r"(?i)\b(remove-item|ri|del|erase|rd|rmdir)\b[^|;&]*(-recurse|/s)\b[^|;&]*(^|[\s\x22'=])(c:|\$env:systemdrive)(\\(\*(\.\*)?|windows(\\system32)?)?\\?)?[\x22']?(\s|$)",
        ),
        (
            DestructiveKind::SystemDriveDelete,
            r"(?i)\b(remove-item|del|rd|rmdir)\b[^|;&]*\\windows\\system32\b",
        ),
        (
            DestructiveKind::SystemDriveDelete,
            r"(?i)\b(remove-item|ri|del|erase|rd|rmdir)\b[^|;&]*\$env:windir[\x22']?(\s|$)",
        ),
        // reg delete HKLM\..., Remove-Item HKLM:\...
        (
            DestructiveKind::MachineRegistryDelete,
            r"(?i)\breg(\.exe)?\s+delete\s+[\x22']?(hklm|hkey_local_machine)\b",
        ),
        (
            DestructiveKind::MachineRegistryDelete,
            r"(?i)\b(remove-item|remove-itemproperty|ri)\b[^|;&]*\b(hklm|hkey_local_machine):",
        ),
        (DestructiveKind::BootConfigEdit, r"(?i)\bbcdedit\b"),
        (DestructiveKind::BootConfigEdit, r"(?i)\bbcdboot\b"),
        (DestructiveKind::BootConfigEdit, r"(?i)\bbootrec\b"),
        (DestructiveKind::BootConfigEdit, r"(?i)\befibootmgr\b"),
        (DestructiveKind::BootConfigEdit, r"(?i)\bgrub2?-install\b"),
        (DestructiveKind::BootConfigEdit, r"(?i)/boot/(grub2?/grub\.cfg|efi)\b"),
        (DestructiveKind::DiskPartitioning, r"(?i)\bdiskpart\b"),
        (
            DestructiveKind::DiskPartitioning,
            r"(?i)\b(new|remove|resize)-partition\b",
        ),
        (
            DestructiveKind::DiskPartitioning,
            r"(?i)\b(fdisk|sfdisk|cfdisk|gdisk|sgdisk|parted|gparted)\b",
        ),
        (DestructiveKind::RawDiskWrite, r"(?i)\bdd\b[^|;&]*\bof=/dev/"),
        (DestructiveKind::RawDiskWrite, r"(?i)>\s*/dev/(sd|hd|vd|nvme|mmcblk|disk)"),
        (DestructiveKind::RawDiskWrite, r"(?i)\\\\\.\\physicaldrive\d"),
    ];

    rules
        .iter()
        .filter_map(|(kind, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*kind, re)),
            Err(e) => {
                tracing::error!("Invalid deny-list pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
});

/// First destructive class matched by `command`, if any
pub fn classify_destructive(command: &str) -> Option<DestructiveKind> {
    DENY_RULES
        .iter()
        .find(|(_, re)| re.is_match(command))
        .map(|(kind, _)| *kind)
}

pub fn is_destructive(command: &str) -> bool {
    classify_destructive(command).is_some()
}

/// One deny-list match in a fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    /// Zero-based position in the fix's command list
    pub index: usize,
    pub command: String,
    pub kind: DestructiveKind,
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command {} `{}` {}", self.index + 1, self.command, self.kind)
    }
}

/// Scan every command; never stops at the first hit
pub fn scan_fix_commands(commands: &[String]) -> Vec<SafetyViolation> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(index, command)| {
            classify_destructive(command).map(|kind| SafetyViolation {
                index,
                command: command.clone(),
                kind,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_compile() {
        assert_eq!(DENY_RULES.len(), 24);
    }

    #[test]
    fn test_drive_format() {
        assert_eq!(classify_destructive("format C: /q"), Some(DestructiveKind::DriveFormat));
        assert_eq!(classify_destructive("FORMAT d:"), Some(DestructiveKind::DriveFormat));
        assert_eq!(
            classify_destructive("Format-Volume -DriveLetter D"),
            Some(DestructiveKind::DriveFormat)
        );
        assert_eq!(classify_destructive("mkfs.ext4 /dev/sdb1"), Some(DestructiveKind::DriveFormat));
    }

    #[test]
    fn test_system_drive_delete() {
        assert_eq!(classify_destructive("rm -rf /"), Some(DestructiveKind::SystemDriveDelete));
        assert_eq!(classify_destructive("rm -fr /*"), Some(DestructiveKind::SystemDriveDelete));
        assert_eq!(
            classify_destructive("Remove-Item C:\\ -Recurse -Force"),
            Some(DestructiveKind::SystemDriveDelete)
        );
        assert_eq!(
            classify_destructive("rd /s /q C:\\"),
            Some(DestructiveKind::SystemDriveDelete)
        );
        for command in [
            "del /s /q C:\\*.*",
            "del /s /q \"C:\\*\"",
            "Remove-Item -Recurse -Force C:\\Windows",
            "Remove-Item C:\\Windows\\ -Recurse",
            "Remove-Item -Path $env:SystemDrive\\* -Recurse -Force",
            "rd /s /q C:\\Windows\\System32",
            "Remove-Item $env:windir -Recurse",
            "rm -rf \"/\"",
            "rm -rf '/*'",
        ] {
            assert_eq!(
                classify_destructive(command),
                Some(DestructiveKind::SystemDriveDelete),
                "{}",
                command
            );
        }
    }

    #[test]
    fn test_scoped_deletes_are_not_system_drive() {
        assert!(!is_destructive("del /s /q C:\\Users\\bob\\AppData\\Local\\Temp\\*"));
        assert!(!is_destructive("Remove-Item -Recurse C:\\Windows\\Temp\\*"));
        assert!(!is_destructive("rm -rf /tmp/cache"));
    }

    #[test]
    fn test_registry_and_boot() {
        assert_eq!(
            classify_destructive("reg delete HKLM\\SYSTEM\\CurrentControlSet\\Services\\foo /f"),
            Some(DestructiveKind::MachineRegistryDelete)
        );
        assert_eq!(
            classify_destructive("Remove-Item -Path HKLM:\\SOFTWARE\\Vendor -Recurse"),
            Some(DestructiveKind::MachineRegistryDelete)
        );
        assert_eq!(
            classify_destructive("bcdedit /set {default} safeboot minimal"),
            Some(DestructiveKind::BootConfigEdit)
        );
        assert_eq!(classify_destructive("diskpart /s script.txt"), Some(DestructiveKind::DiskPartitioning));
        assert_eq!(classify_destructive("parted /dev/sda rm 1"), Some(DestructiveKind::DiskPartitioning));
        assert_eq!(
            classify_destructive("dd if=/dev/zero of=/dev/sda bs=1M"),
            Some(DestructiveKind::RawDiskWrite)
        );
    }

    #[test]
    fn test_ordinary_fix_commands_pass() {
        let benign = [
            "sfc /scannow",
            "DISM /Online /Cleanup-Image /RestoreHealth",
            "Remove-Item $env:TEMP\\* -Recurse -Force",
            "rm -rf /tmp/medic-cache",
            "reg delete HKCU\\Software\\Vendor\\Cache /f",
            "systemctl restart NetworkManager",
            "ipconfig /flushdns",
            "apt-get clean",
            "chkdsk C: /scan",
        ];
        for command in benign {
            assert_eq!(classify_destructive(command), None, "{}", command);
        }
    }

    #[test]
    fn test_scan_is_exhaustive() {
        let commands = vec![
            "ipconfig /flushdns".to_string(),
            "format C:".to_string(),
            "sfc /scannow".to_string(),
            "bcdedit /deletevalue safeboot".to_string(),
        ];
        let violations = scan_fix_commands(&commands);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].index, 1);
        assert_eq!(violations[0].kind, DestructiveKind::DriveFormat);
        assert_eq!(violations[1].index, 3);
        assert_eq!(violations[1].kind, DestructiveKind::BootConfigEdit);
        assert!(violations[1].to_string().contains("boot configuration"));
    }
}
