//! 外部页面转换器（如 avif_converter）的调用封装。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::pipeline::PipelineError;

const STDERR_LIMIT: usize = 512;

/// Runs `<program> [args...] <input> <output>` once per page.
#[derive(Debug, Clone)]
pub struct Converter {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl Converter {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    /// 转换单个页面；非零退出码或超时视为失败，超时会终止子进程。
    pub async fn convert(&self, input: &Path, output: &Path) -> Result<(), PipelineError> {
        let page = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::ConverterSpawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let output_result = match time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::ConverterTimeout {
                    page,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output_result.status.success() {
            let stderr = String::from_utf8_lossy(&output_result.stderr);
            let mut stderr = stderr.trim().to_string();
            if stderr.len() > STDERR_LIMIT {
                let mut cut = STDERR_LIMIT;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(PipelineError::ConverterFailed {
                page,
                status: output_result.status.to_string(),
                stderr,
            });
        }

        debug!(page = %page, output = ?output, "page converted");
        Ok(())
    }
}
