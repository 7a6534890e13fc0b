//! 语音合成引擎
//!
//! 引擎与模型都是同步接口，协调器在阻塞线程中调用它们。
//! CommandSpeechEngine 通过外部程序完成推理：参数中的 `{text}` `{voice}` `{model}` `{device}` `{output}`
//! 会被替换成实际值，进程以 0 退出且输出文件存在才算成功。

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::SynthesisError;

/// 已加载的模型，不可重入：同一时刻只允许一个调用
pub trait VoiceModel: Send + Sync {
    fn synthesize(&self, text: &str, voice_preset: &str, output: &Path) -> Result<(), SynthesisError>;
}

/// 按 (模型, 设备) 加载模型
pub trait SpeechEngine: Send + Sync {
    fn load(&self, model_id: &str, device: &str) -> Result<Arc<dyn VoiceModel>, SynthesisError>;
}

#[derive(Debug, Clone)]
pub struct CommandSpeechEngine {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSpeechEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl SpeechEngine for CommandSpeechEngine {
    fn load(&self, model_id: &str, device: &str) -> Result<Arc<dyn VoiceModel>, SynthesisError> {
        let resolved = which_program(&self.program).ok_or_else(|| SynthesisError::ModelLoad {
            model: model_id.to_string(),
            reason: format!("engine program {} not found", self.program.display()),
        })?;
        tracing::info!(model = model_id, device = device, "Loaded speech engine {}", resolved.display());
        Ok(Arc::new(CommandVoiceModel {
            program: resolved,
            args: self.args.clone(),
            model: model_id.to_string(),
            device: device.to_string(),
            timeout: self.timeout,
        }))
    }
}

/// 绝对或相对路径直接检查；裸程序名在 PATH 中查找
fn which_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

struct CommandVoiceModel {
    program: PathBuf,
    args: Vec<String>,
    model: String,
    device: String,
    timeout: Duration,
}

impl CommandVoiceModel {
    fn render_args(&self, text: &str, voice: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{text}", text)
                    .replace("{voice}", voice)
                    .replace("{model}", &self.model)
                    .replace("{device}", &self.device)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

impl VoiceModel for CommandVoiceModel {
    fn synthesize(&self, text: &str, voice_preset: &str, output: &Path) -> Result<(), SynthesisError> {
        let mut child = Command::new(&self.program)
            .args(self.render_args(text, voice_preset, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SynthesisError::Inference(format!("failed to start engine: {}", e)))?;

        // 超时后杀掉进程，保证资源在返回时已经空闲
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SynthesisError::Timeout(self.timeout));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(SynthesisError::Inference(e.to_string())),
            }
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                use std::io::Read;
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(SynthesisError::Inference(format!(
                "engine exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        if !output.is_file() {
            return Err(SynthesisError::Inference(format!(
                "engine produced no file at {}",
                output.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_placeholders_are_substituted() {
        let model = CommandVoiceModel {
            program: PathBuf::from("/bin/true"),
            args: vec!["--text={text}".into(), "{voice}".into(), "{model}@{device}".into(), "{output}".into()],
            model: "bark".into(),
            device: "cpu".into(),
            timeout: Duration::from_secs(1),
        };
        let args = model.render_args("hello", "v2/en_speaker_6", Path::new("/tmp/a.wav"));
        assert_eq!(args, vec!["--text=hello", "v2/en_speaker_6", "bark@cpu", "/tmp/a.wav"]);
    }

    #[test]
    fn test_missing_program_fails_to_load() {
        let engine = CommandSpeechEngine::new("/nonexistent/engine", vec![], Duration::from_secs(1));
        assert!(matches!(engine.load("default", "cpu"), Err(SynthesisError::ModelLoad { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_writes_output_file() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.wav");
        let engine = CommandSpeechEngine::new("sh", vec!["-c".into(), "echo {text} > {output}".into()], Duration::from_secs(5));
        let model = engine.load("default", "cpu").unwrap();
        model.synthesize("hi", "voice", &output).unwrap();
        assert!(output.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let engine = CommandSpeechEngine::new("sh", vec!["-c".into(), "exit 3".into()], Duration::from_secs(5));
        let model = engine.load("default", "cpu").unwrap();
        assert!(matches!(
            model.synthesize("hi", "voice", &dir.path().join("x.wav")),
            Err(SynthesisError::Inference(_))
        ));
    }
}
