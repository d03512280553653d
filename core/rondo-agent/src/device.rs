//! Stable short device id for this installation.
//!
//! The 8-char token doubles as the inviter's capability key inside invite
//! codes, so it must survive restarts: generated once, then read back from
//! the data directory.

use std::path::Path;

use fs_err as fs;
use rand::Rng;
use rondo_protocol::SHORT_DEVICE_ID_LEN;

const DEVICE_ID_FILE: &str = "device-id";
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn short_device_id(data_dir: &Path) -> Result<String, String> {
    let path = data_dir.join(DEVICE_ID_FILE);

    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if trimmed.chars().count() == SHORT_DEVICE_ID_LEN {
            return Ok(trimmed.to_string());
        }
        // A mangled file is replaced rather than trusted.
    }

    let id = generate();
    fs::write(&path, &id).map_err(|err| format!("failed to persist device id: {err}"))?;
    Ok(id)
}

fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_DEVICE_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_an_eight_char_alphanumeric_id() {
        let id = generate();
        assert_eq!(id.len(), SHORT_DEVICE_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn id_is_stable_across_calls() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let first = short_device_id(temp_dir.path()).expect("first id");
        let second = short_device_id(temp_dir.path()).expect("second id");
        assert_eq!(first, second);
    }

    #[test]
    fn mangled_id_file_is_regenerated() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        fs::write(temp_dir.path().join(DEVICE_ID_FILE), "bad").expect("seed file");

        let id = short_device_id(temp_dir.path()).expect("regenerated id");
        assert_eq!(id.chars().count(), SHORT_DEVICE_ID_LEN);
        assert_ne!(id, "bad");
    }
}
