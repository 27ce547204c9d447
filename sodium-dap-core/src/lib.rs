//! Sodium デバッガブリッジのコア機能
//!
//! このクレートは、構造化されたデバッグ要求とSodiumデバッガの
//! 行指向テキストプロトコルとの間の変換ロジックを提供します。
//! コマンドの直列化、応答テキストの分類、ブレークポイントIDの照合を統合します。

pub mod breakpoint;
pub mod bridge;
pub mod classify;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod gate;
pub mod session;

pub use breakpoint::{BreakpointRegistry, SourceBreakpoint};
pub use bridge::{SessionPrompt, SodiumBridge};
pub use classify::{Action, OutputClassifier};
pub use command::DebuggerCommand;
pub use config::{PathSanitizer, SessionConfig};
pub use errors::BridgeError;
pub use events::{DebugEvent, EventBus};
pub use gate::{RequestGate, SendTicket};
pub use session::{
    ReplyValue, ResponseChannel, SessionState, StackFrame, StopLocation, VariableInfo,
    VariableScope,
};

// 他のクレートから使用するために再エクスポート
pub use sodium_dap_target::{exit_message, DebuggerProcess, ProcessState};

/// ブリッジの結果型
pub type Result<T> = anyhow::Result<T>;
