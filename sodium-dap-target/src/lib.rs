//! Sodium デバッギプロセス制御
//!
//! このクレートは、デバッグ対象側のSodiumデバッガ子プロセスを制御するための
//! 低レベル機能を提供します。起動、標準入出力パイプ、終了コードの解釈などを行います。

pub mod process;

pub use process::{exit_message, DebuggerProcess, ProcessState};

/// デバッギ制御の結果型
pub type Result<T> = anyhow::Result<T>;
