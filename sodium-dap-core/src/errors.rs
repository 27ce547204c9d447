//! ブリッジのエラー分類

use thiserror::Error;

/// ブリッジが消費側へ返すエラーの分類
///
/// 回復不能な状態はすべて terminated イベントとして一様に通知され、
/// 再接続やプロセスの再起動は消費側の責務です。
#[derive(Debug, Error)]
pub enum BridgeError {
    /// デバッギプロセスが存在しない（コマンドは end イベントへ縮退する）
    #[error("Sodium debugger process is not available")]
    ProcessUnavailable,

    /// マッチした応答シェイプ内のペイロードが解析できない（セッション終了）
    #[error("unparseable payload in debugger reply: {0}")]
    ProtocolParse(String),

    /// デバッギがセッションIDを拒否した（セッションは待機状態のまま）
    #[error("no Sodium session found for id {0}")]
    SessionNotFound(String),

    /// デバッギが予期せず終了した
    #[error("{}", sodium_dap_target::exit_message(*.0))]
    UnexpectedExit(Option<i32>),

    /// 待機中の応答がプロセス終了により強制解決された
    #[error("debug session ended before a reply arrived")]
    SessionEnded,
}
