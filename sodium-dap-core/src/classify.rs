//! 応答テキストの分類
//!
//! デバッギの標準出力は半構造化テキストであり、複数の応答シェイプが
//! 構文的に重なり合います。ここでは優先順に並べたシェイプ照合表を
//! 先頭から試し、最初に一致したものだけを採用します。

use crate::config::PathSanitizer;
use crate::errors::BridgeError;
use crate::session::{StackFrame, VariableInfo, VariableScope};
use regex::Regex;
use serde_json::Value;

/// 分類結果のディスパッチ指示
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// セッションIDが拒否された（セッションは待機状態のまま）
    SessionNotFound { message: String },
    /// アタッチ成功の通知
    ThreadCreated { thread_id: u64 },
    /// フレーム選択の確認応答（ディスパッチなし）
    FrameSelected,
    /// 式評価の結果
    EvaluateResult { value: Value },
    /// スタックフレーム一覧
    StackPayload { frames: Vec<StackFrame> },
    /// 変数一覧
    VariablesPayload {
        scope: VariableScope,
        variables: Vec<VariableInfo>,
    },
    /// 既知のキーを持たない構造化ペイロード（破棄される）
    UnrecognizedPayload,
    /// ブレークポイントIDの確定通知
    BreakpointConfirmed { id: u32, file: String, line: u32 },
    /// ブレークポイントヒット
    BreakpointHit {
        id: u32,
        procedure: String,
        file: String,
        line: u32,
    },
    /// ステップ・継続実行の着地位置
    SteppedTo { file: String, line: u32 },
}

/// デバッギ内部のエスケープ記号（そのままではJSON文字列エスケープと衝突する）
const ESCAPE_MARKER: char = '\\';

/// ペイロード解析前にエスケープ記号を二重化する
fn double_escape_markers(fragment: &str) -> String {
    fragment.replace(ESCAPE_MARKER, r"\\")
}

/// 1シェイプ分の照合関数
///
/// 一致しなければ `None`、一致したら（解析失敗も含めて）その結果を返します。
type ShapeMatcher = fn(&OutputClassifier, &str) -> Option<Result<Action, BridgeError>>;

/// 優先順に並んだ (シェイプ名, 照合関数) の表
///
/// 先頭から順に試し、最初の一致で確定します。並び順がそのまま優先度です。
const SHAPES: &[(&str, ShapeMatcher)] = &[
    ("no-session-found", OutputClassifier::match_no_session),
    ("thread-created", OutputClassifier::match_thread_created),
    ("frame-ack", OutputClassifier::match_frame_ack),
    ("watch-result", OutputClassifier::match_watch),
    ("structured-payload", OutputClassifier::match_payload),
    ("breakpoint-confirmed", OutputClassifier::match_breakpoint_confirmed),
    ("breakpoint-hit", OutputClassifier::match_breakpoint_hit),
    ("stepped-to", OutputClassifier::match_stepped_to),
];

/// 応答シェイプの照合エンジン
///
/// 正規表現は構築時に一度だけコンパイルされます。
pub struct OutputClassifier {
    sanitizer: PathSanitizer,
    /// シェイプ1: セッション不在
    re_no_session: Regex,
    /// シェイプ2: スレッド生成通知
    re_thread_created: Regex,
    /// シェイプ3: フレーム選択の確認応答
    re_frame_ack: Regex,
    /// シェイプ4: 式評価結果のキー
    re_watch_key: Regex,
    /// シェイプ5: 埋め込みJSON断片
    re_json_fragment: Regex,
    /// シェイプ6: ブレークポイント確定
    re_breakpoint_confirmed: Regex,
    /// シェイプ7: ブレークポイントヒット
    re_breakpoint_hit: Regex,
    /// シェイプ8: ステップ着地（制御マーカー区切り）
    re_stepped_to: Regex,
}

impl OutputClassifier {
    /// 新しい照合エンジンを作成する
    pub fn new(sanitizer: PathSanitizer) -> Result<Self, regex::Error> {
        Ok(Self {
            sanitizer,
            re_no_session: Regex::new(r"(?m)^.*No session found.*$")?,
            re_thread_created: Regex::new(r"\[New Thread (?P<id>\d+)\]")?,
            re_frame_ack: Regex::new(r#"\{\s*"frame"\s*:"#)?,
            re_watch_key: Regex::new(r#""watch"\s*:"#)?,
            re_json_fragment: Regex::new(r"(?s)[\[{].*[\]}]")?,
            re_breakpoint_confirmed: Regex::new(
                r"(?P<id>\d{1,3}) at 0x0000:  file (?P<file>[\w.:\\\-]+), line (?P<line>\d+)",
            )?,
            re_breakpoint_hit: Regex::new(
                r"Breakpoint (?P<id>\d{1,3}), (?P<procedure>[\w.:()\\\-]+) at (?P<file>[\w.:\\\-]+):(?P<line>\d{1,3})",
            )?,
            re_stepped_to: Regex::new(
                r"\x1a\x1a(?P<drive>[A-Za-z]):(?P<file>[\w.\\\-]+):(?P<line>\d{1,3})",
            )?,
        })
    }

    /// 生テキストを優先順のシェイプ照合にかける
    ///
    /// [`SHAPES`] を先頭から試し、最初に一致したシェイプで確定します。
    /// どのシェイプにも一致しないテキストは意味を持たないものとして
    /// `None` で破棄されます。一致したシェイプ内のJSONが壊れている場合は
    /// プロトコル逸脱としてエラーを返します（再同期点は定義されない）。
    pub fn classify(&self, raw: &str) -> Result<Option<Action>, BridgeError> {
        for (name, matcher) in SHAPES {
            if let Some(result) = matcher(self, raw) {
                tracing::trace!(shape = %name, "reply matched");
                return result.map(Some);
            }
        }
        Ok(None)
    }

    /// シェイプ1: セッション不在の通知
    fn match_no_session(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let m = self.re_no_session.find(raw)?;
        Some(Ok(Action::SessionNotFound {
            message: m.as_str().trim().to_string(),
        }))
    }

    /// シェイプ2: スレッド生成によるアタッチ確認
    fn match_thread_created(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let caps = self.re_thread_created.captures(raw)?;
        let thread_id = caps["id"].parse().unwrap_or(0);
        Some(Ok(Action::ThreadCreated { thread_id }))
    }

    /// シェイプ3: フレーム選択の確認応答（内容は見ない）
    fn match_frame_ack(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        if self.re_frame_ack.is_match(raw) {
            Some(Ok(Action::FrameSelected))
        } else {
            None
        }
    }

    /// シェイプ4: `watch` キー付きJSONオブジェクトを評価結果として解析する
    fn match_watch(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        if !self.re_watch_key.is_match(raw) {
            return None;
        }
        let result = match self.re_json_fragment.find(raw) {
            Some(fragment) => parse_json_fragment(fragment.as_str()).map(|parsed| {
                let value = parsed.get("watch").cloned().unwrap_or(parsed);
                Action::EvaluateResult { value }
            }),
            None => Err(BridgeError::ProtocolParse(
                "watch reply without JSON body".into(),
            )),
        };
        Some(result)
    }

    /// シェイプ5: 汎用の構造化ペイロードをキーで振り分ける
    fn match_payload(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let fragment = self.re_json_fragment.find(raw)?;
        Some(self.dispatch_payload(fragment.as_str()))
    }

    fn dispatch_payload(&self, fragment: &str) -> Result<Action, BridgeError> {
        let parsed = parse_json_fragment(fragment)?;

        if let Some(frames) = parsed.get("frames").and_then(Value::as_array) {
            return Ok(Action::StackPayload {
                frames: self.decode_frames(frames),
            });
        }

        let scopes = [
            ("locals", VariableScope::Locals),
            ("args", VariableScope::Args),
            ("globals", VariableScope::Globals),
        ];
        for (key, scope) in scopes {
            if let Some(vars) = parsed.get(key).and_then(Value::as_array) {
                return Ok(Action::VariablesPayload {
                    scope,
                    variables: decode_variables(vars),
                });
            }
        }

        Ok(Action::UnrecognizedPayload)
    }

    /// シェイプ6: ブレークポイント確定の通知
    fn match_breakpoint_confirmed(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let caps = self.re_breakpoint_confirmed.captures(raw)?;
        Some(Ok(Action::BreakpointConfirmed {
            id: caps["id"].parse().unwrap_or(0),
            file: caps["file"].to_string(),
            line: caps["line"].parse().unwrap_or(0),
        }))
    }

    /// シェイプ7: ブレークポイントヒット
    fn match_breakpoint_hit(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let caps = self.re_breakpoint_hit.captures(raw)?;
        Some(Ok(Action::BreakpointHit {
            id: caps["id"].parse().unwrap_or(0),
            procedure: caps["procedure"].to_string(),
            file: self.sanitizer.sanitize(&caps["file"]),
            line: caps["line"].parse().unwrap_or(0),
        }))
    }

    /// シェイプ8: 制御マーカー区切りのステップ着地位置
    fn match_stepped_to(&self, raw: &str) -> Option<Result<Action, BridgeError>> {
        let caps = self.re_stepped_to.captures(raw)?;
        let file = format!("{}:{}", &caps["drive"], &caps["file"]);
        Some(Ok(Action::SteppedTo {
            file: self.sanitizer.sanitize(&file),
            line: caps["line"].parse().unwrap_or(0),
        }))
    }

    /// `frames` 配列をフレーム記述子の列へ変換する
    ///
    /// 手続き名かファイルを欠く要素は読み捨てます。列番号は常に1です。
    fn decode_frames(&self, frames: &[Value]) -> Vec<StackFrame> {
        frames
            .iter()
            .filter_map(|frame| {
                let procedure = field_str(frame, "procedure")?;
                let file = field_str(frame, "file")?;
                Some(StackFrame {
                    id: field_u64(frame, "stackid").unwrap_or(0),
                    name: format!("{}()", procedure),
                    file: self.sanitizer.sanitize(&file),
                    line: field_u64(frame, "line").unwrap_or(0) as u32,
                    column: 1,
                })
            })
            .collect()
    }
}

/// 変数配列を名前・値・型の三つ組へ変換する
fn decode_variables(vars: &[Value]) -> Vec<VariableInfo> {
    vars.iter()
        .filter_map(|var| {
            Some(VariableInfo {
                name: field_str(var, "name")?,
                value: field_str(var, "value").unwrap_or_default(),
                type_name: field_str(var, "type"),
            })
        })
        .collect()
}

/// エスケープ記号を二重化してからJSONとして解析する
fn parse_json_fragment(fragment: &str) -> Result<Value, BridgeError> {
    serde_json::from_str(&double_escape_markers(fragment))
        .map_err(|e| BridgeError::ProtocolParse(e.to_string()))
}

/// 文字列・数値のどちらで届いてもよいフィールドの読み出し
fn field_u64(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> OutputClassifier {
        OutputClassifier::new(PathSanitizer::default()).unwrap()
    }

    #[test]
    fn test_no_session_found() {
        let action = classifier()
            .classify("No session found with id: 99999 !\r\n")
            .unwrap()
            .unwrap();
        match action {
            Action::SessionNotFound { message } => {
                assert!(message.contains("No session found"));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_thread_created() {
        let action = classifier()
            .classify("[New Thread 4242]\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(action, Action::ThreadCreated { thread_id: 4242 });
    }

    #[test]
    fn test_frame_ack_is_consumed_silently() {
        let action = classifier().classify("{\"frame\": 2}\r\n").unwrap().unwrap();
        assert_eq!(action, Action::FrameSelected);
    }

    #[test]
    fn test_frames_payload_is_not_mistaken_for_frame_ack() {
        // "frames" キーはフレーム選択応答ではなくスタックペイロード
        let action = classifier()
            .classify(r#"{"frames": []}"#)
            .unwrap()
            .unwrap();
        assert_eq!(action, Action::StackPayload { frames: Vec::new() });
    }

    #[test]
    fn test_watch_reply_resolves_evaluate() {
        let action = classifier()
            .classify(r#"{"watch": {"name": "nCount", "value": "5", "type": "NUMBER"}}"#)
            .unwrap()
            .unwrap();
        match action {
            Action::EvaluateResult { value } => {
                assert_eq!(value["value"], "5");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_stack_payload_with_escape_markers_roundtrips() {
        // デバッギはJSON文字列内に生のエスケープ記号を埋め込んでくる
        let raw = r#"{"frames": [{"stackid": "0", "procedure": "logon2oracle", "file": "C:\projects\Sodium-Site\welcome.sqlx", "line": "6"}]}"#;
        let action = classifier().classify(raw).unwrap().unwrap();
        match action {
            Action::StackPayload { frames } => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].name, "logon2oracle()");
                assert_eq!(frames[0].file, r"c:\projects\Sodium-Site\welcome.sqlx");
                assert_eq!(frames[0].line, 6);
                assert_eq!(frames[0].column, 1);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_locals_payload() {
        let raw = r#"{"locals": [{"name": "nTotal", "value": "12", "type": "NUMBER"}, {"name": "sName", "value": "abc", "type": "STRING"}]}"#;
        let action = classifier().classify(raw).unwrap().unwrap();
        match action {
            Action::VariablesPayload { scope, variables } => {
                assert_eq!(scope, VariableScope::Locals);
                assert_eq!(variables.len(), 2);
                assert_eq!(variables[0].name, "nTotal");
                assert_eq!(variables[0].value, "12");
                assert_eq!(variables[0].type_name.as_deref(), Some("NUMBER"));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_args_and_globals_payloads() {
        let args = classifier()
            .classify(r#"{"args": [{"name": "pId", "value": "1", "type": "NUMBER"}]}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(
            args,
            Action::VariablesPayload {
                scope: VariableScope::Args,
                ..
            }
        ));

        let globals = classifier()
            .classify(r#"{"globals": [{"name": "gState", "value": "on", "type": "STRING"}]}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(
            globals,
            Action::VariablesPayload {
                scope: VariableScope::Globals,
                ..
            }
        ));
    }

    #[test]
    fn test_unrecognized_payload_is_flagged() {
        let action = classifier()
            .classify(r#"["loose", "array"]"#)
            .unwrap()
            .unwrap();
        assert_eq!(action, Action::UnrecognizedPayload);
    }

    #[test]
    fn test_malformed_payload_is_protocol_drift() {
        let err = classifier()
            .classify(r#"{"locals": [broken}"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolParse(_)));
    }

    #[test]
    fn test_breakpoint_confirmed_scenario() {
        // break "main.sqlx:6"; への確認応答
        let action = classifier()
            .classify("7 at 0x0000:  file main.sqlx, line 6.\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            Action::BreakpointConfirmed {
                id: 7,
                file: "main.sqlx".to_string(),
                line: 6,
            }
        );
    }

    #[test]
    fn test_breakpoint_hit_scenario() {
        let action = classifier()
            .classify("Breakpoint 7, proc() at main.sqlx:6\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            Action::BreakpointHit {
                id: 7,
                procedure: "proc()".to_string(),
                file: "main.sqlx".to_string(),
                line: 6,
            }
        );
    }

    #[test]
    fn test_breakpoint_hit_with_full_path_is_sanitized() {
        let raw = r"Breakpoint 2, cb_oracle.logon2oracle() at C:\projects\Sodium\Setup\Sodium-Site\welcome.sqlx:6";
        let action = classifier().classify(raw).unwrap().unwrap();
        match action {
            Action::BreakpointHit {
                id,
                procedure,
                file,
                line,
            } => {
                assert_eq!(id, 2);
                assert_eq!(procedure, "cb_oracle.logon2oracle()");
                assert_eq!(file, r"c:\projects\Sodium\Setup\Sodium-Site\welcome.sqlx");
                assert_eq!(line, 6);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_stepped_to_location() {
        let raw = "\u{1a}\u{1a}C:\\projects\\Sodium-Site\\welcome.sqlx:9:1:beg:0x0000";
        let action = classifier().classify(raw).unwrap().unwrap();
        assert_eq!(
            action,
            Action::SteppedTo {
                file: r"c:\projects\Sodium-Site\welcome.sqlx".to_string(),
                line: 9,
            }
        );
    }

    #[test]
    fn test_meaningless_text_is_dropped() {
        let c = classifier();
        assert_eq!(c.classify("Reading symbols from target...").unwrap(), None);
        assert_eq!(c.classify("").unwrap(), None);
        assert_eq!(c.classify("Continuing.\r\n").unwrap(), None);
    }

    #[test]
    fn test_priority_session_shape_wins_over_json() {
        // セッション不在の通知にJSON風の断片が混ざってもシェイプ1が勝つ
        let action = classifier()
            .classify("No session found with id: {99999}")
            .unwrap()
            .unwrap();
        assert!(matches!(action, Action::SessionNotFound { .. }));
    }

    #[test]
    fn test_double_escape_markers() {
        assert_eq!(double_escape_markers(r"C:\x"), r"C:\\x");
        assert_eq!(double_escape_markers("no markers"), "no markers");
    }
}
