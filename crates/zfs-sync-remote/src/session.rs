//! ssh session arguments

use zfs_sync_types::{ConnectTimeout, Host, RemoteHost};

/// Options applied to every ssh session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Program used to open sessions
    pub program: String,
    /// Never prompt for passwords
    pub batch_mode: bool,
    /// Verify host keys
    pub strict_host_key_checking: bool,
    /// Extra `-o` options, e.g. `Compression=no`
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            batch_mode: true,
            strict_host_key_checking: false,
            extra_options: Vec::new(),
        }
    }
}

/// Exit status ssh reports when the session itself failed
pub const SSH_CONNECTION_FAILURE: i32 = 255;

impl SshOptions {
    /// `ssh -o ... user@host`, ready for a remote command argument
    pub fn argv(&self, remote: &RemoteHost) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        let mut option = |value: String| {
            argv.push("-o".to_string());
            argv.push(value);
        };

        option(format!("ConnectTimeout={}", remote.connect_timeout.secs()));
        if self.batch_mode {
            option("BatchMode=yes".to_string());
        }
        if !self.strict_host_key_checking {
            option("StrictHostKeyChecking=no".to_string());
        }
        for extra in &self.extra_options {
            option(extra.clone());
        }

        argv.push(remote.destination());
        argv
    }

    /// Connect timeout for a host, the default for the local machine
    pub fn connect_timeout(host: &Host) -> ConnectTimeout {
        match host {
            Host::Local => ConnectTimeout::default(),
            Host::Remote(remote) => remote.connect_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn remote() -> RemoteHost {
        RemoteHost {
            address: "backup01".to_string(),
            user: "root".to_string(),
            connect_timeout: ConnectTimeout::from_secs(15).unwrap(),
        }
    }

    #[test]
    fn test_default_session_arguments() {
        let argv = SshOptions::default().argv(&remote());

        assert_eq!(
            argv,
            vec![
                "ssh",
                "-o",
                "ConnectTimeout=15",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "root@backup01",
            ]
        );
    }

    #[test]
    fn test_extra_options_follow_builtin_ones() {
        let options = SshOptions {
            strict_host_key_checking: true,
            extra_options: vec!["Compression=no".to_string()],
            ..SshOptions::default()
        };
        let argv = options.argv(&remote());

        assert!(!argv.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(argv[argv.len() - 2], "Compression=no");
        assert_eq!(argv.last().unwrap(), "root@backup01");
    }

    #[rstest]
    #[case(true, false, "root", vec!["-o", "ConnectTimeout=15", "-o", "BatchMode=yes", "root@backup01"])]
    #[case(false, false, "root", vec!["-o", "ConnectTimeout=15", "root@backup01"])]
    #[case(false, true, "", vec!["-o", "ConnectTimeout=15", "-o", "StrictHostKeyChecking=no", "backup01"])]
    fn test_session_argument_variants(
        #[case] batch_mode: bool,
        #[case] relaxed_host_keys: bool,
        #[case] user: &str,
        #[case] expected: Vec<&str>,
    ) {
        let options = SshOptions {
            batch_mode,
            strict_host_key_checking: !relaxed_host_keys,
            ..SshOptions::default()
        };
        let host = RemoteHost {
            user: user.to_string(),
            ..remote()
        };

        let argv = options.argv(&host);
        assert_eq!(argv[0], "ssh");
        assert_eq!(&argv[1..], expected.as_slice());
    }
}
