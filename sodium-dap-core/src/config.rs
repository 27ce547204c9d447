//! セッション設定とパス正規化

use std::path::PathBuf;

/// セッションIDの既定値（対話プロンプトの初期値）
pub const DEFAULT_SESSION_ID: &str = "16786";

/// 1セッション分の設定
///
/// 除外された設定レイヤから供給される値を明示的な構造体として受け取ります。
/// プロセス全体の可変グローバルは持ちません。
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// SodiumDebugger実行ファイルのパス
    pub debugger_path: PathBuf,
    /// デバッギの作業ディレクトリ
    pub working_dir: PathBuf,
    /// セッションID（未設定の場合は初回利用時にプロンプトされる）
    pub session_id: Option<String>,
    /// コマンド・応答のトレースログを有効にする
    pub trace: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debugger_path: PathBuf::from(r"C:\projects\Sodium\Setup\SodiumDebugger.exe"),
            working_dir: PathBuf::from(r"C:\projects\Sodium\Setup"),
            session_id: None,
            trace: false,
        }
    }
}

/// 消費側へ渡すファイルパスの正規化規則
///
/// ドライブレター接頭辞を小文字へ正規化します。既定の対応表は
/// 歴史的経緯により `E:` を `d:` へ写します（転記ミスの疑いがあるが
/// 挙動保存のため既定値に残している）。表は差し替え可能です。
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    table: Vec<(char, char)>,
}

impl PathSanitizer {
    /// 対応表を指定して作成する
    pub fn with_table(table: Vec<(char, char)>) -> Self {
        Self { table }
    }

    /// ドライブレター付きパスを正規化する
    ///
    /// 先頭の `X:` が表にあれば差し替え、なければ小文字化のみ行います。
    pub fn sanitize(&self, path: &str) -> String {
        let mut chars = path.chars();
        let drive = match (chars.next(), chars.next()) {
            (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => drive,
            _ => return path.to_string(),
        };

        let mapped = self
            .table
            .iter()
            .find(|(from, _)| *from == drive)
            .map(|(_, to)| *to)
            .unwrap_or_else(|| drive.to_ascii_lowercase());

        let rest: String = path.chars().skip(2).collect();
        format!("{}:{}", mapped, rest)
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::with_table(vec![('C', 'c'), ('D', 'd'), ('E', 'd')])
    }
}
