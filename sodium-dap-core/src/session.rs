//! セッション状態と応答待ちスロット

use std::collections::HashMap;
use tokio::sync::oneshot;

/// 論理応答チャネル
///
/// ゲートにより未応答コマンドは常に高々1件なので、占有されるスロットも
/// システム全体で高々1個です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseChannel {
    Stack,
    Locals,
    Args,
    Globals,
    Evaluate,
}

/// 変数問い合わせのスコープ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    Locals,
    Args,
    Globals,
}

impl VariableScope {
    /// 対応する応答チャネル
    pub fn channel(self) -> ResponseChannel {
        match self {
            Self::Locals => ResponseChannel::Locals,
            Self::Args => ResponseChannel::Args,
            Self::Globals => ResponseChannel::Globals,
        }
    }
}

/// スタックフレーム記述子
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StackFrame {
    pub id: u64,
    /// 表示名（手続き名に `()` を付けたもの）
    pub name: String,
    /// 正規化済みのファイルパス
    pub file: String,
    pub line: u32,
    /// 常に1
    pub column: u32,
}

/// 変数の名前・値・型の三つ組
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
}

/// 応答スロットへ渡される値
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyValue {
    Frames(Vec<StackFrame>),
    Variables(Vec<VariableInfo>),
    Scalar(serde_json::Value),
}

/// 直近の実行停止位置
///
/// ブレークポイントヒットまたはステップ着地のたびに上書きされます。
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StopLocation {
    pub breakpoint_id: Option<u32>,
    pub procedure: String,
    pub file: String,
    pub line: u32,
}

/// アタッチ識別子と応答待ちスロットの保持者
pub struct SessionState {
    session_id: Option<String>,
    prompted: bool,
    slots: HashMap<ResponseChannel, oneshot::Sender<ReplyValue>>,
    stop: StopLocation,
}

impl SessionState {
    /// 新しいセッション状態を作成する
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            prompted: false,
            slots: HashMap::new(),
            stop: StopLocation::default(),
        }
    }

    /// キャッシュ済みのセッションIDを返す
    ///
    /// 未設定の場合は外部供給のプロンプトを一度だけ呼び出し、
    /// 得られた値を以後不変のままキャッシュします。
    pub fn identity(&mut self, prompt: impl FnOnce() -> Option<String>) -> Option<String> {
        if self.session_id.is_none() && !self.prompted {
            self.prompted = true;
            self.session_id = prompt();
        }
        self.session_id.clone()
    }

    /// 対応するコマンド送信の直前にスロットを占有する
    ///
    /// 占有済みスロットへの bind はプログラミングエラーであり、
    /// 正しいゲート運用下では起こり得ません（発生時は旧スロットを破棄）。
    pub fn bind(&mut self, channel: ResponseChannel) -> oneshot::Receiver<ReplyValue> {
        let (tx, rx) = oneshot::channel();
        if self.slots.insert(channel, tx).is_some() {
            tracing::error!(?channel, "response slot was already bound");
        }
        rx
    }

    /// スロットを消費して値を待機側へ引き渡す
    pub fn resolve(&mut self, channel: ResponseChannel, value: ReplyValue) -> bool {
        match self.slots.remove(&channel) {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(?channel, "no pending slot for reply");
                false
            }
        }
    }

    /// 全スロットを強制解決する（プロセス終了時）
    ///
    /// 送信側を破棄することで、待機中の受信側はエラーで起こされます。
    pub fn abort_all(&mut self) {
        self.slots.clear();
    }

    /// 停止位置を更新する
    pub fn set_stop_location(&mut self, stop: StopLocation) {
        self.stop = stop;
    }

    /// 直近の停止位置を返す
    pub fn stop_location(&self) -> &StopLocation {
        &self.stop
    }
}
