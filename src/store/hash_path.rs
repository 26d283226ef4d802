//! Mailbox name to filesystem path mapping.

use std::path::{Path, PathBuf};

use crate::store::StoreError;

/// Longest accepted mailbox name, in bytes.
pub const MAX_MAILBOX_NAME: usize = 490;
/// Longest accepted on-disk path, in bytes.
pub const MAX_MAILBOX_PATH: usize = 4096;

/// Directory level holding virtual domains.
const DOMAIN_DIR: &str = "domain";

/// Partition layout switches.
///
/// `virt_domains` splits `domain!local` names into a per-domain subtree;
/// `hash_spool` inserts single-character hash directories so large spools
/// do not degenerate into one huge directory.
#[derive(Clone, Debug)]
pub struct PartitionConfig {
    pub root: PathBuf,
    pub virt_domains: bool,
    pub hash_spool: bool,
}

impl PartitionConfig {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        PartitionConfig {
            root: root.as_ref().to_owned(),
            virt_domains: false,
            hash_spool: false,
        }
    }
}

/// Stable single-character directory bucket for `name`.
///
/// Alphabetic first characters bucket by lowercased letter, everything
/// else lands in 'q'.
pub fn dir_hash_char(name: &str) -> char {
    match name.as_bytes().first() {
        Some(c) if c.is_ascii_alphabetic() => c.to_ascii_lowercase() as char,
        _ => 'q',
    }
}

/// Compute the directory of the mailbox `name` under `config`.
///
/// Dots in the logical name map to `/` on disk. The hash character is
/// taken from the component after the leading hierarchy element (so all
/// of a user's mailboxes share a bucket), or from the whole name when
/// there is no dot.
pub fn mailbox_path(config: &PartitionConfig, name: &str) -> Result<PathBuf, StoreError> {
    if name.is_empty() || name.len() > MAX_MAILBOX_NAME {
        return Err(StoreError::PathTooLong);
    }

    let mut path = config.root.clone();
    let mut local = name;

    if config.virt_domains {
        if let Some(bang) = name.find('!') {
            let domain = &name[..bang];
            local = &name[bang + 1..];
            if config.hash_spool {
                path.push(DOMAIN_DIR);
                path.push(dir_hash_char(domain).to_string());
                path.push(domain);
            } else {
                path.push(DOMAIN_DIR);
                path.push(domain);
            }
        }
    }

    if config.hash_spool {
        let idx = match local.find('.') {
            Some(dot) => &local[dot + 1..],
            None => local,
        };
        path.push(dir_hash_char(idx).to_string());
    }

    path.push(local.replace('.', "/"));

    if path.as_os_str().len() > MAX_MAILBOX_PATH {
        return Err(StoreError::PathTooLong);
    }

    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_placement() {
        let config = PartitionConfig::new("/var/spool/mail");
        let path = mailbox_path(&config, "user.bob.sent").unwrap();
        assert_eq!(path, PathBuf::from("/var/spool/mail/user/bob/sent"));
    }

    #[test]
    fn hashed_placement() {
        let mut config = PartitionConfig::new("/var/spool/mail");
        config.hash_spool = true;
        let path = mailbox_path(&config, "user.bob.sent").unwrap();
        assert_eq!(path, PathBuf::from("/var/spool/mail/b/user/bob/sent"));

        let path = mailbox_path(&config, "shared").unwrap();
        assert_eq!(path, PathBuf::from("/var/spool/mail/s/shared"));
    }

    #[test]
    fn virtual_domains() {
        let mut config = PartitionConfig::new("/var/spool/mail");
        config.virt_domains = true;
        config.hash_spool = true;
        let path = mailbox_path(&config, "example.org!user.bob").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/var/spool/mail/domain/e/example.org/b/user/bob")
        );
    }

    #[test]
    fn nonalphabetic_bucket() {
        assert_eq!(dir_hash_char("7up"), 'q');
        assert_eq!(dir_hash_char("Bob"), 'b');
        assert_eq!(dir_hash_char(""), 'q');
    }

    #[test]
    fn oversized_name_rejected() {
        let config = PartitionConfig::new("/var/spool/mail");
        let long = "x".repeat(MAX_MAILBOX_NAME + 1);
        assert!(matches!(
            mailbox_path(&config, &long),
            Err(StoreError::PathTooLong)
        ));
    }
}
