//! デバッギプロセス制御機能

use crate::Result;
use anyhow::Context;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// デバッギプロセスのライフサイクル状態
///
/// Exited / Crashed は終端状態であり、以降の遷移はありません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// 起動直後（標準入出力の配線前）
    Starting,
    /// 実行中
    Running,
    /// 正常終了（終了コードあり）
    Exited,
    /// シグナル等による異常終了
    Crashed,
}

/// デバッグ対象側のSodiumデバッガ子プロセス
///
/// 子プロセスと標準入出力パイプを排他的に所有します。
/// パイプは配線時に一度だけ取り出され、以降はこの構造体が
/// プロセスの生存と終了コードのみを管理します。
pub struct DebuggerProcess {
    child: Child,
    state: ProcessState,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl DebuggerProcess {
    /// デバッギを起動してパイプ付きで返す
    ///
    /// 標準入力・標準出力・標準エラーをすべてパイプで接続します。
    pub fn spawn<P: AsRef<Path>>(program: P, cwd: P) -> Result<Self> {
        let program = program.as_ref();
        tracing::debug!(program = %program.display(), "spawning Sodium debugger");
        let mut child = Command::new(program)
            .current_dir(cwd.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn Sodium debugger at {}", program.display()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Self {
            child,
            state: ProcessState::Starting,
            stdin,
            stdout,
            stderr,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// 現在のライフサイクル状態を取得する
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// 標準入力パイプを取り出す（一度だけ）
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// 標準出力パイプを取り出す（一度だけ）
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// 標準エラーパイプを取り出す（一度だけ）
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// 標準入出力の配線完了後に実行中へ遷移させる
    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }
    }

    /// プロセスを強制終了する
    ///
    /// 冪等であり、既に終了している場合は何もしません。
    pub async fn kill(&mut self) {
        if matches!(self.state, ProcessState::Exited | ProcessState::Crashed) {
            return;
        }
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
        self.state = ProcessState::Crashed;
    }

    /// プロセスの終了を待機し、終端状態へ遷移させる
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.state = if status.code().is_some() {
            ProcessState::Exited
        } else {
            ProcessState::Crashed
        };
        Ok(status)
    }
}

/// 終了コードを説明メッセージへ対応付ける
///
/// 既知のコードは個別のメッセージに、それ以外は既定のメッセージになります。
pub fn exit_message(code: Option<i32>) -> String {
    match code {
        Some(10) => "Sodium Server is not running or not accessible !".to_string(),
        Some(code) => format!(
            "Communication between IDE and Sodium Debugger lost with code {}",
            code
        ),
        None => "Communication between IDE and Sodium Debugger lost (terminated by signal)"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_message_known_code() {
        assert_eq!(
            exit_message(Some(10)),
            "Sodium Server is not running or not accessible !"
        );
    }

    #[test]
    fn test_exit_message_default() {
        assert_eq!(
            exit_message(Some(3)),
            "Communication between IDE and Sodium Debugger lost with code 3"
        );
        assert!(exit_message(None).contains("terminated by signal"));
    }
}
