//! PKCS12 keystore generation through `openssl`

use certrelay_proto::CertificateResource;

use crate::command::{CommandError, CommandRunner};

pub const OPENSSL: &str = "openssl";

/// Carries the export passphrase to `openssl` without putting it on the command line
pub const PASSPHRASE_ENV: &str = "CERTRELAY_P12_PASS";

/// Arguments for `openssl pkcs12 -export` reading PEM from stdin
pub fn pkcs12_args() -> Vec<String> {
    vec![
        "pkcs12".to_string(),
        "-export".to_string(),
        "-passout".to_string(),
        format!("env:{}", PASSPHRASE_ENV),
    ]
}

/// Build a PKCS12 keystore holding the certificate and its private key
pub async fn build_keystore(
    runner: &dyn CommandRunner,
    cr: &CertificateResource,
    passphrase: &str,
) -> Result<Vec<u8>, CommandError> {
    let input = cr.cert_and_key_pem();
    let output = runner
        .run(
            OPENSSL,
            &pkcs12_args(),
            &[(PASSPHRASE_ENV, passphrase)],
            Some(&input),
        )
        .await?;
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<String>, Vec<(String, String)>, Vec<u8>)>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            env: &[(&str, &str)],
            stdin: Option<&[u8]>,
        ) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.to_vec(),
                env.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                stdin.unwrap_or_default().to_vec(),
            ));
            Ok(CommandOutput {
                stdout: b"P12".to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_keystore_invocation() {
        let runner = Recorder::default();
        let cr = CertificateResource {
            certificate: b"CERT\n".to_vec(),
            private_key: b"KEY\n".to_vec(),
            ..Default::default()
        };

        let bytes = build_keystore(&runner, &cr, "changeit").await.unwrap();
        assert_eq!(bytes, b"P12");

        let calls = runner.calls.lock().unwrap();
        let (program, args, env, stdin) = &calls[0];
        assert_eq!(program, "openssl");
        assert_eq!(args, &pkcs12_args());
        assert!(args.iter().all(|arg| !arg.contains("changeit")));
        assert_eq!(
            env,
            &vec![(PASSPHRASE_ENV.to_string(), "changeit".to_string())]
        );
        assert_eq!(stdin, &cr.cert_and_key_pem());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_does_not_reveal_passphrase() {
        use crate::command::SystemCommandRunner;

        // Stands in for openssl rejecting its input
        struct FailingOpenssl;

        #[async_trait]
        impl CommandRunner for FailingOpenssl {
            async fn run(
                &self,
                _program: &str,
                args: &[String],
                env: &[(&str, &str)],
                _stdin: Option<&[u8]>,
            ) -> Result<CommandOutput, CommandError> {
                let mut script = vec![
                    "-c".to_string(),
                    "echo unable to load >&2; exit 1".to_string(),
                ];
                script.extend(args.iter().cloned());
                SystemCommandRunner.run("sh", &script, env, None).await
            }
        }

        let cr = CertificateResource {
            certificate: b"garbage".to_vec(),
            private_key: b"garbage".to_vec(),
            ..Default::default()
        };
        let err = build_keystore(&FailingOpenssl, &cr, "s3cr3t-pass")
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("unable to load"));
        assert!(!text.contains("s3cr3t-pass"));
    }
}
