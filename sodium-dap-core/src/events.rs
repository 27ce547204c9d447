//! 消費側へのイベント配信

use tokio::sync::mpsc;

/// ブリッジが発行する型付きイベント
///
/// 語彙は固定であり、配信は送りっぱなし（fire-and-forget）です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// セッションIDの確定後、要求受け付けの開始を通知
    Initialized,
    /// エントリ到達による停止
    StoppedEntry,
    /// ステップ実行の発行による停止
    StoppedStep,
    /// ブレークポイントヒットによる停止
    StoppedBreakpoint,
    /// データブレークポイントによる停止（スタブ経路からは発行されない）
    StoppedDataBreakpoint,
    /// 例外による停止（現行のシェイプからは発行されない）
    StoppedException,
    /// ブレークポイントIDが確定した
    BreakpointValidated { id: u32, verified: bool },
    /// デバッギ由来のテキスト出力
    Output {
        text: String,
        file: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
    },
    /// セッション終了（"end"）
    Terminated,
}

/// イベント発行面
///
/// 受信側が閉じていても発行は失敗しません。
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<DebugEvent>,
}

impl EventBus {
    /// バスと受信側のペアを作成する
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DebugEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// イベントを発行する
    pub fn emit(&self, event: DebugEvent) {
        tracing::trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    /// テキスト出力イベントを発行する
    pub fn output(&self, text: impl Into<String>) {
        self.emit(DebugEvent::Output {
            text: text.into(),
            file: None,
            line: None,
            column: None,
        });
    }

    /// セッション終了イベントを発行する
    pub fn terminated(&self) {
        self.emit(DebugEvent::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_delivers_in_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(DebugEvent::Initialized);
        bus.output("hello");
        bus.terminated();

        assert_eq!(rx.try_recv().unwrap(), DebugEvent::Initialized);
        assert!(matches!(rx.try_recv().unwrap(), DebugEvent::Output { .. }));
        assert_eq!(rx.try_recv().unwrap(), DebugEvent::Terminated);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        // 受信側が閉じていてもパニックしない
        bus.terminated();
    }
}
