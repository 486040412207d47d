//! Symmetric encryption of archive parts, delegated to an external tool.

use crate::config::{EncryptOptConfig, EncryptTool};
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// openssl reads the passphrase from this variable so it never shows in `ps`.
const PASS_ENV: &str = "DBBACKUP_ENCRYPT_PASS";

#[derive(Debug, Clone)]
pub struct Encryptor {
    tool: EncryptTool,
    program: PathBuf,
    passphrase: String,
    log_file: Option<PathBuf>,
}

impl Encryptor {
    /// `None` when encryption is off.
    pub fn from_config(cfg: &EncryptOptConfig, tool_dir: Option<&Path>) -> Result<Option<Self>> {
        if !cfg.encrypt_enable {
            return Ok(None);
        }
        if cfg.passphrase.is_empty() {
            return Err(BackupError::validation("encryption requires a passphrase"));
        }
        let name = match cfg.encrypt_tool {
            EncryptTool::Openssl => "openssl",
            EncryptTool::Xbcrypt => "xbcrypt",
        };
        Ok(Some(Self {
            tool: cfg.encrypt_tool,
            program: find_tool(name, None, tool_dir)?,
            passphrase: cfg.passphrase.clone(),
            log_file: None,
        }))
    }

    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Suffix the tool appends to encrypted files.
    pub fn suffix(&self) -> &'static str {
        suffix_for(self.tool)
    }

    /// xbcrypt takes the passphrase from a file. The file is private to
    /// the owner and removed when dropped.
    fn key_file(&self) -> Result<Option<NamedTempFile>> {
        if !matches!(self.tool, EncryptTool::Xbcrypt) {
            return Ok(None);
        }
        let mut file = tempfile::Builder::new().prefix("xbcrypt-key-").tempfile()?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(self.passphrase.as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }

    fn command(&self, decrypt: bool, input: &Path, output: &Path, key_file: Option<&Path>) -> ExternalCommand {
        let cmd = match self.tool {
            EncryptTool::Openssl => {
                let mut cmd = ExternalCommand::new("openssl", &self.program).arg("enc");
                if decrypt {
                    cmd = cmd.arg("-d");
                }
                cmd.args(["-aes-256-cbc", "-pbkdf2", "-salt"])
                    .arg("-in")
                    .arg(input.display().to_string())
                    .arg("-out")
                    .arg(output.display().to_string())
                    .arg("-pass")
                    .arg(format!("env:{}", PASS_ENV))
                    .env(PASS_ENV, &self.passphrase)
            }
            EncryptTool::Xbcrypt => {
                let mut cmd = ExternalCommand::new("xbcrypt", &self.program);
                if decrypt {
                    cmd = cmd.arg("--decrypt");
                }
                cmd = cmd.arg("--encrypt-algo=AES256");
                if let Some(key) = key_file {
                    cmd = cmd.arg(format!("--encrypt-key-file={}", key.display()));
                }
                cmd.arg(format!("--input={}", input.display()))
                    .arg(format!("--output={}", output.display()))
            }
        };
        match &self.log_file {
            Some(log) => cmd.log_to(log),
            None => cmd,
        }
    }

    /// Encrypt `path` to `<path><suffix>` and remove the plaintext.
    pub async fn encrypt(&self, path: &Path) -> Result<PathBuf> {
        let output = PathBuf::from(format!("{}{}", path.display(), self.suffix()));
        let key = self.key_file()?;
        self.command(false, path, &output, key.as_ref().map(|k| k.path()))
            .run()
            .await?;
        tokio::fs::remove_file(path).await?;
        info!(file = %output.display(), "Encrypted");
        Ok(output)
    }

    /// Decrypt `<name><suffix>` back to `<name>`, keeping the encrypted file.
    pub async fn decrypt(&self, path: &Path) -> Result<PathBuf> {
        let name = path.to_string_lossy();
        let plain = name.strip_suffix(self.suffix()).ok_or_else(|| {
            BackupError::validation(format!("{} does not end with {}", name, self.suffix()))
        })?;
        let output = PathBuf::from(plain);
        let key = self.key_file()?;
        self.command(true, path, &output, key.as_ref().map(|k| k.path()))
            .run()
            .await?;
        Ok(output)
    }
}

pub fn suffix_for(tool: EncryptTool) -> &'static str {
    match tool {
        EncryptTool::Openssl => ".enc",
        EncryptTool::Xbcrypt => ".xb",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn encryptor(tool: EncryptTool) -> Encryptor {
        Encryptor {
            tool,
            program: PathBuf::from("/usr/bin/tool"),
            passphrase: "s3cret".to_string(),
            log_file: None,
        }
    }

    #[test]
    fn test_disabled_returns_none() {
        let cfg = EncryptOptConfig::default();
        assert!(Encryptor::from_config(&cfg, None).unwrap().is_none());
    }

    #[test]
    fn test_openssl_keeps_passphrase_out_of_argv() {
        let e = encryptor(EncryptTool::Openssl);
        assert!(e.key_file().unwrap().is_none());
        let cmd = e.command(false, Path::new("/b/t_0.tar"), Path::new("/b/t_0.tar.enc"), None);
        assert!(cmd.get_args().iter().all(|a| !a.contains("s3cret")));
        assert_eq!(e.suffix(), ".enc");
    }

    #[test]
    fn test_xbcrypt_reads_key_from_private_file() {
        let e = encryptor(EncryptTool::Xbcrypt);
        let key = e.key_file().unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(key.path()).unwrap(), "s3cret");
        let mode = std::fs::metadata(key.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let cmd = e.command(true, Path::new("/b/t.tar.part_0.xb"), Path::new("/b/t.tar.part_0"), Some(key.path()));
        let args = cmd.get_args();
        assert!(args.iter().any(|a| a == "--decrypt"));
        assert!(args.contains(&format!("--encrypt-key-file={}", key.path().display())));
        assert!(args.iter().all(|a| !a.contains("s3cret")));
        assert!(!cmd.display().contains("s3cret"));
        assert_eq!(e.suffix(), ".xb");
    }

    #[tokio::test]
    async fn test_xbcrypt_key_file_lives_for_the_run() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("xbcrypt");
        std::fs::write(
            &tool,
            "#!/bin/sh\n\
             for a in \"$@\"; do case $a in --encrypt-key-file=*) k=${a#*=};; --output=*) o=${a#*=};; esac; done\n\
             cat \"$k\" > \"$o\"\n\
             echo \"$k\" > \"$o.key\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let e = Encryptor {
            program: tool,
            ..encryptor(EncryptTool::Xbcrypt)
        };

        let plain = e.decrypt(&dir.path().join("t.tar.part_0.xb")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&plain).unwrap(), "s3cret");
        let key_path = std::fs::read_to_string(dir.path().join("t.tar.part_0.key")).unwrap();
        assert!(!Path::new(key_path.trim()).exists());
    }

    #[tokio::test]
    async fn test_decrypt_rejects_wrong_suffix() {
        let e = encryptor(EncryptTool::Openssl);
        let err = e.decrypt(Path::new("/b/t_0.tar")).await.unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }
}
