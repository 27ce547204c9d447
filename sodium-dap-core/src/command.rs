//! デバッギへ送信するワイヤコマンド

use std::fmt;

/// Sodiumデバッガのコンソールコマンド
///
/// ワイヤ表現は行指向のASCIIで、各コマンドは `;` と CRLF で終端されます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerCommand {
    /// ブレークポイントを設定
    Break { path: String, line: u32 },
    /// 実行継続
    Continue,
    /// 次の行へ（ステップオーバー）
    Next,
    /// ステップイン
    Step,
    /// 現在の手続きから抜けるまで実行
    Finish,
    /// スタックフレームを選択
    Frame(u32),
    /// スタックフレーム一覧を問い合わせ
    InfoFrame,
    /// ローカル変数を問い合わせ
    InfoLocals,
    /// 引数を問い合わせ
    InfoArgs,
    /// グローバル変数を問い合わせ
    InfoGlobals,
    /// 式を評価
    Whatis(String),
    /// Sodiumサーバのセッションへアタッチ
    Attach(String),
    /// 指定ファイルの全ブレークポイントを削除
    ClearAllBreakpoints(String),
}

impl DebuggerCommand {
    /// ワイヤ表現へエンコードする（CRLF終端込み）
    pub fn encode(&self) -> String {
        format!("{};\r\n", self)
    }
}

impl fmt::Display for DebuggerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Break { path, line } => write!(f, "break \"{}:{}\"", path, line),
            Self::Continue => write!(f, "continue"),
            Self::Next => write!(f, "next"),
            Self::Step => write!(f, "step"),
            Self::Finish => write!(f, "finish"),
            Self::Frame(n) => write!(f, "frame {}", n),
            Self::InfoFrame => write!(f, "info frame"),
            Self::InfoLocals => write!(f, "info locals"),
            Self::InfoArgs => write!(f, "info args"),
            Self::InfoGlobals => write!(f, "info globals"),
            Self::Whatis(expr) => write!(f, "whatis {}", expr),
            Self::Attach(session_id) => write!(f, "attach {}", session_id),
            Self::ClearAllBreakpoints(path) => write!(f, "clearallbreakpoints \"{}\"", path),
        }
    }
}
