//! Integration tests for the tas-host command line
//!
//! These run the built binary and only cover paths that end before any USB
//! or input device is touched.

use std::path::Path;
use std::process::{Command, Output};

fn tas_host(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tas-host"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run tas-host")
}

mod startup {
    use super::*;

    #[test]
    fn test_help_lists_options() {
        let dir = tempfile::tempdir().unwrap();
        let output = tas_host(dir.path(), &["--help"]);
        assert!(output.status.success());

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("--movie"));
        assert!(stdout.contains("--save-config"));
    }

    #[test]
    fn test_save_config_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let output = tas_host(dir.path(), &["--save-config"]);
        assert!(output.status.success());

        let path = dir.path().join("tas-host").join("host.toml");
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("0x16c0:0x0486"));
        assert!(content.contains("[wire]"));
    }
}

mod movie_validation {
    use super::*;

    #[test]
    fn test_missing_movie_fails() {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("absent.gmv");
        let output = tas_host(dir.path(), &["-m", movie.to_str().unwrap()]);

        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Failed to load movie"));
    }

    #[test]
    fn test_bad_signature_fails() {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("bad.gmv");
        let mut data = vec![0u8; 64];
        data[..15].copy_from_slice(b"Gens Movie FAKE");
        data.extend_from_slice(&[0xff; 3]);
        std::fs::write(&movie, data).unwrap();

        let output = tas_host(dir.path(), &["--movie", movie.to_str().unwrap()]);
        assert!(!output.status.success());
    }

    #[test]
    fn test_savestate_movie_fails() {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("savestate.gmv");
        let mut data = vec![0u8; 64];
        data[..15].copy_from_slice(b"Gens Movie TEST");
        data[15] = b'A';
        data[20] = b'3';
        data[22] = 0x40;
        data.extend_from_slice(&[0xff; 6]);
        std::fs::write(&movie, data).unwrap();

        let output = tas_host(dir.path(), &["-m", movie.to_str().unwrap()]);
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("savestate"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("host.toml");
        std::fs::write(&config, "[usb]\ndevice = \"16c0-0486\"\n").unwrap();

        let output = tas_host(dir.path(), &["-c", config.to_str().unwrap()]);
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Failed to load configuration"));
    }
}
