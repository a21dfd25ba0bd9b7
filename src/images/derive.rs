use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::{DerivedSize, ImagesConfig};
use crate::error::{DecetyError, Result};

/// Produces a derived raster (thumbnail, preview) from source bytes.
#[async_trait]
pub trait ImageDeriver: Send + Sync {
    async fn derive(&self, source: Bytes, size: DerivedSize) -> Result<Bytes>;
}

/// Runs an external program that reads the source on stdin and writes the
/// derived raster to stdout, e.g. ImageMagick `convert - -resize 200x200 jpg:-`.
#[derive(Debug, Clone)]
pub struct CommandDeriver {
    program: String,
    args: Vec<String>,
}

impl CommandDeriver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ImagesConfig) -> Self {
        Self::new(config.deriver_program.clone(), config.deriver_args.clone())
    }

    fn render_args(&self, size: DerivedSize) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{width}", &size.width.to_string())
                    .replace("{height}", &size.height.to_string())
                    .replace("{quality}", &size.quality.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl ImageDeriver for CommandDeriver {
    #[instrument(skip(self, source), fields(program = %self.program, width = size.width, height = size.height))]
    async fn derive(&self, source: Bytes, size: DerivedSize) -> Result<Bytes> {
        let mut child = Command::new(&self.program)
            .args(self.render_args(size))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecetyError::Derivation(format!("spawn {}: {e}", self.program)))?;

        // stdin must be fed while stdout is being drained
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DecetyError::Derivation("child stdin unavailable".into()))?;
        let writer = tokio::spawn(async move {
            let res = stdin.write_all(&source).await;
            drop(stdin);
            res
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DecetyError::Derivation(format!("wait {}: {e}", self.program)))?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DecetyError::Derivation(format!("write stdin: {e}"))),
            Err(e) => return Err(DecetyError::Derivation(format!("stdin task: {e}"))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecetyError::Derivation(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(DecetyError::Derivation(format!(
                "{} produced no output",
                self.program
            )));
        }

        debug!(out_len = output.stdout.len(), "derived image");
        Ok(Bytes::from(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: DerivedSize = DerivedSize {
        width: 64,
        height: 32,
        quality: 70,
    };

    #[test]
    fn test_args_substitution() {
        let deriver = CommandDeriver::from_config(&ImagesConfig::default());
        assert_eq!(
            deriver.render_args(SIZE),
            vec!["-", "-resize", "64x32", "-quality", "70", "jpg:-"]
        );
    }

    #[tokio::test]
    async fn test_cat_passes_bytes_through() {
        let deriver = CommandDeriver::new("cat", vec![]);
        let out = deriver
            .derive(Bytes::from_static(b"raster"), SIZE)
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"raster");
    }

    #[tokio::test]
    async fn test_failing_program_is_derivation_error() {
        let deriver = CommandDeriver::new("false", vec![]);
        let res = deriver.derive(Bytes::from_static(b"x"), SIZE).await;
        assert!(matches!(res, Err(DecetyError::Derivation(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_derivation_error() {
        let deriver = CommandDeriver::new("/nonexistent/decety-resizer", vec![]);
        let res = deriver.derive(Bytes::from_static(b"x"), SIZE).await;
        assert!(matches!(res, Err(DecetyError::Derivation(_))));
    }
}
