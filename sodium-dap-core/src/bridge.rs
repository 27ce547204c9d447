//! ブリッジ本体
//!
//! 消費側の要求をゲートで直列化してデバッギへ送り、標準出力の分類結果を
//! レジストリ・セッション状態・イベントへ反映します。分類とディスパッチは
//! 単一の読み取りタスク上でのみ実行され、互いに並行しません。

use crate::breakpoint::{BreakpointRegistry, SourceBreakpoint};
use crate::classify::{Action, OutputClassifier};
use crate::command::DebuggerCommand;
use crate::config::{PathSanitizer, SessionConfig};
use crate::errors::BridgeError;
use crate::events::{DebugEvent, EventBus};
use crate::gate::{RequestGate, SendTicket};
use crate::session::{
    ReplyValue, ResponseChannel, SessionState, StackFrame, StopLocation, VariableInfo,
    VariableScope,
};
use crate::Result;
use anyhow::Context;
use sodium_dap_target::DebuggerProcess;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};

/// 設定完了ハンドシェイクの上限待ち時間
///
/// セッション開始時のこの待機だけが有限で、他の待機はすべて非有界です。
const CONFIG_HANDSHAKE_WAIT: Duration = Duration::from_millis(1000);

/// セッションIDを対話的に供給する外部プロンプト
pub type SessionPrompt = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// 排他所有されるミュータブル状態
struct Inner {
    registry: BreakpointRegistry,
    session: SessionState,
    data_breakpoints: HashSet<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    gate: RequestGate,
    events: EventBus,
    classifier: OutputClassifier,
    alive: AtomicBool,
    kill: Notify,
    config_done: Notify,
}

/// 構造化デバッグ要求とSodiumデバッガのコンソールプロトコルの橋渡し
pub struct SodiumBridge {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    prompt: SessionPrompt,
}

impl SodiumBridge {
    /// 設定に従ってデバッギを起動し、ブリッジを構築する
    ///
    /// tokioランタイム上で呼び出す必要があります。起動に失敗した場合は
    /// 終了イベントを発行してからエラーを返します。
    pub fn connect(
        config: SessionConfig,
        sanitizer: PathSanitizer,
        prompt: SessionPrompt,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DebugEvent>)> {
        let (events, events_rx) = EventBus::new();

        let mut process =
            match DebuggerProcess::spawn(&config.debugger_path, &config.working_dir) {
                Ok(process) => process,
                Err(e) => {
                    events.terminated();
                    return Err(e);
                }
            };

        let stdin = process
            .take_stdin()
            .context("debugger process has no stdin pipe")?;
        let stdout = process
            .take_stdout()
            .context("debugger process has no stdout pipe")?;
        let stderr = process
            .take_stderr()
            .context("debugger process has no stderr pipe")?;
        process.mark_running();
        tracing::info!(pid = ?process.pid(), "Sodium debugger spawned");

        let shared = Self::new_shared(config.session_id.clone(), sanitizer, events)?;

        tokio::spawn(read_loop(stdout, shared.clone()));
        tokio::spawn(stderr_loop(stderr, shared.clone()));
        tokio::spawn(supervise(process, shared.clone()));

        Ok((
            Self {
                shared,
                writer: tokio::sync::Mutex::new(Box::new(stdin)),
                prompt,
            },
            events_rx,
        ))
    }

    /// 任意の双方向ストリームの上にブリッジを構築する
    ///
    /// プロセス管理を伴わない配線で、主に結合テストから使用します。
    pub fn with_transport<T>(
        transport: T,
        config: SessionConfig,
        sanitizer: PathSanitizer,
        prompt: SessionPrompt,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DebugEvent>)>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (events, events_rx) = EventBus::new();
        let (read_half, write_half) = tokio::io::split(transport);
        let shared = Self::new_shared(config.session_id, sanitizer, events)?;

        tokio::spawn(read_loop(read_half, shared.clone()));

        Ok((
            Self {
                shared,
                writer: tokio::sync::Mutex::new(Box::new(write_half)),
                prompt,
            },
            events_rx,
        ))
    }

    fn new_shared(
        session_id: Option<String>,
        sanitizer: PathSanitizer,
        events: EventBus,
    ) -> Result<Arc<Shared>> {
        Ok(Arc::new(Shared {
            inner: Mutex::new(Inner {
                registry: BreakpointRegistry::new(),
                session: SessionState::new(session_id),
                data_breakpoints: HashSet::new(),
            }),
            gate: RequestGate::new(),
            events,
            classifier: OutputClassifier::new(sanitizer)?,
            alive: AtomicBool::new(true),
            kill: Notify::new(),
            config_done: Notify::new(),
        }))
    }

    /// セッションIDを確定させ、初期化済みイベントを発行する
    ///
    /// IDが未設定であれば外部プロンプトを一度だけ呼び出します。
    pub fn initialize(&self) -> Option<String> {
        let id = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.session.identity(|| (self.prompt)())
        };
        self.shared.events.emit(DebugEvent::Initialized);
        id
    }

    /// Sodiumサーバのセッションへアタッチし、実行を開始する
    ///
    /// アタッチ送信後、設定完了の合図を有限時間だけ待ってから開始します。
    pub async fn attach(&self, stop_on_entry: bool) -> Result<()> {
        self.ensure_alive()?;
        let session_id = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.session.identity(|| (self.prompt)())
        };
        let session_id = session_id.context("no Sodium session id supplied")?;

        let ticket = self.shared.gate.acquire().await;
        self.send(DebuggerCommand::Attach(session_id), ticket)
            .await?;

        let _ = tokio::time::timeout(CONFIG_HANDSHAKE_WAIT, self.shared.config_done.notified())
            .await;

        self.start(stop_on_entry).await
    }

    /// 設定完了を通知する（消費側がブレークポイント設定を終えた合図）
    pub fn configuration_done(&self) {
        self.shared.config_done.notify_one();
    }

    /// 実行を開始する
    ///
    /// エントリ停止が要求された場合は1ステップだけ進めて停止イベントを
    /// 発行し、そうでなければ実行継続します。
    pub async fn start(&self, stop_on_entry: bool) -> Result<()> {
        if stop_on_entry {
            self.step_command(DebuggerCommand::Next, DebugEvent::StoppedEntry)
                .await
        } else {
            self.issue(DebuggerCommand::Continue).await
        }
    }

    /// ブレークポイントを設定する
    ///
    /// 仮IDを持つレコードを即座に返します。確定IDは後続の確認応答で
    /// 非同期に割り当てられます。
    pub async fn set_breakpoint(&self, path: &str, line: u32) -> Result<SourceBreakpoint> {
        self.ensure_alive()?;
        let ticket = self.shared.gate.acquire().await;
        let bp = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.registry.set(path, line)
        };
        self.send(
            DebuggerCommand::Break {
                path: path.to_string(),
                line,
            },
            ticket,
        )
        .await?;
        Ok(bp)
    }

    /// 指定ファイルの全ブレークポイントを削除する
    ///
    /// デバッギへのクリアコマンドはちょうど1回発行されます。
    pub async fn clear_breakpoints(&self, path: &str) -> Result<usize> {
        self.ensure_alive()?;
        let ticket = self.shared.gate.acquire().await;
        let removed = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.registry.clear(path)
        };
        self.send(DebuggerCommand::ClearAllBreakpoints(path.to_string()), ticket)
            .await?;
        Ok(removed)
    }

    /// ブレークポイントを1件だけ削除する（ローカルのみ）
    pub fn remove_breakpoint(&self, path: &str, line: u32) -> Option<SourceBreakpoint> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.registry.remove(path, line)
    }

    /// 指定ファイルに登録済みの行番号一覧
    pub fn breakpoint_locations(&self, path: &str) -> Vec<u32> {
        let inner = self.shared.inner.lock().unwrap();
        inner.registry.locations_at(path)
    }

    /// データブレークポイントを記録する（スタブ）
    ///
    /// アドレスを控えるだけで、停止経路は存在しません。
    pub fn set_data_breakpoint(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        let mut inner = self.shared.inner.lock().unwrap();
        inner.data_breakpoints.insert(address.to_string());
        true
    }

    /// 記録済みのデータブレークポイントをすべて破棄する
    pub fn clear_all_data_breakpoints(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.data_breakpoints.clear();
    }

    /// 実行継続
    pub async fn continue_exec(&self) -> Result<()> {
        self.issue(DebuggerCommand::Continue).await
    }

    /// ステップオーバー
    pub async fn next(&self) -> Result<()> {
        self.step_command(DebuggerCommand::Next, DebugEvent::StoppedStep)
            .await
    }

    /// ステップイン
    pub async fn step_in(&self) -> Result<()> {
        self.step_command(DebuggerCommand::Step, DebugEvent::StoppedStep)
            .await
    }

    /// ステップアウト
    pub async fn step_out(&self) -> Result<()> {
        self.step_command(DebuggerCommand::Finish, DebugEvent::StoppedStep)
            .await
    }

    /// スタックフレーム一覧を問い合わせる
    pub async fn request_stack(&self, start_frame: usize, levels: usize) -> Result<Vec<StackFrame>> {
        let rx = self
            .query(ResponseChannel::Stack, DebuggerCommand::InfoFrame)
            .await?;
        match await_reply(rx).await? {
            ReplyValue::Frames(frames) => {
                let end = frames.len().min(start_frame.saturating_add(levels));
                Ok(frames
                    .into_iter()
                    .take(end)
                    .skip(start_frame)
                    .collect())
            }
            other => unexpected_reply("stack", other),
        }
    }

    /// 指定スコープの変数一覧を問い合わせる
    pub async fn request_variables(&self, scope: VariableScope) -> Result<Vec<VariableInfo>> {
        let command = match scope {
            VariableScope::Locals => DebuggerCommand::InfoLocals,
            VariableScope::Args => DebuggerCommand::InfoArgs,
            VariableScope::Globals => DebuggerCommand::InfoGlobals,
        };
        let rx = self.query(scope.channel(), command).await?;
        match await_reply(rx).await? {
            ReplyValue::Variables(variables) => Ok(variables),
            other => unexpected_reply("variables", other),
        }
    }

    /// 式を評価する
    pub async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let rx = self
            .query(
                ResponseChannel::Evaluate,
                DebuggerCommand::Whatis(expression.to_string()),
            )
            .await?;
        match await_reply(rx).await? {
            ReplyValue::Scalar(value) => Ok(value),
            other => unexpected_reply("evaluate", other),
        }
    }

    /// スタックフレームを選択する
    ///
    /// 確認応答は分類側で黙って消費されます。
    pub async fn set_frame(&self, index: u32) -> Result<()> {
        self.issue(DebuggerCommand::Frame(index)).await
    }

    /// 直近の停止位置を返す
    pub fn stop_location(&self) -> StopLocation {
        let inner = self.shared.inner.lock().unwrap();
        inner.session.stop_location().clone()
    }

    /// デバッギプロセスが生きているか
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// デバッギプロセスを終了させる
    ///
    /// 冪等であり、既に終了していれば終了イベントの再通知のみ行います。
    pub fn terminate(&self) {
        if self.is_alive() {
            self.shared.kill.notify_one();
        } else {
            self.shared.events.terminated();
        }
    }

    /// プロセス不在時は end イベントへ縮退させる
    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            self.shared.events.terminated();
            Err(BridgeError::ProcessUnavailable.into())
        }
    }

    /// 応答を待たないコマンドの発行経路
    async fn issue(&self, command: DebuggerCommand) -> Result<()> {
        self.ensure_alive()?;
        let ticket = self.shared.gate.acquire().await;
        self.send(command, ticket).await
    }

    /// ステップ系コマンドの発行と停止イベントの発行
    async fn step_command(&self, command: DebuggerCommand, event: DebugEvent) -> Result<()> {
        self.issue(command).await?;
        self.shared.events.emit(event);
        Ok(())
    }

    /// 応答スロットを占有してから問い合わせを送る
    async fn query(
        &self,
        channel: ResponseChannel,
        command: DebuggerCommand,
    ) -> Result<oneshot::Receiver<ReplyValue>> {
        self.ensure_alive()?;
        let ticket = self.shared.gate.acquire().await;
        let rx = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.session.bind(channel)
        };
        self.send(command, ticket).await?;
        Ok(rx)
    }

    /// ゲート獲得済みの呼び出し元だけが使える送信経路
    async fn send(&self, command: DebuggerCommand, ticket: SendTicket) -> Result<()> {
        let encoded = command.encode();
        tracing::debug!(">>> command ({}): {}", ticket.seq(), command);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(encoded.as_bytes())
            .await
            .with_context(|| format!("failed to send command: {}", command))?;
        writer.flush().await?;
        Ok(())
    }
}

/// 強制解決をセッション終了エラーへ写す
async fn await_reply(rx: oneshot::Receiver<ReplyValue>) -> Result<ReplyValue> {
    rx.await.map_err(|_| BridgeError::SessionEnded.into())
}

fn unexpected_reply<T>(kind: &str, value: ReplyValue) -> Result<T> {
    Err(BridgeError::ProtocolParse(format!("unexpected {} reply payload: {:?}", kind, value)).into())
}

/// 標準出力の読み取りタスク
///
/// チャンク毎に分類・ディスパッチを済ませてから無条件でゲートを解放します。
async fn read_loop<R: AsyncRead + Unpin>(mut stdout: R, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                handle_reply(&shared, &text);
                shared.gate.release(&text);
            }
        }
    }
}

/// 標準エラーの監視タスク
///
/// このデバッギの診断出力は回復不能条件を意味するため、警告を
/// 通知した上でプロセスを殺します。
async fn stderr_loop<R: AsyncRead + Unpin>(mut stderr: R, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];
    match stderr.read(&mut buf).await {
        Ok(n) if n > 0 => {
            let text = String::from_utf8_lossy(&buf[..n]).into_owned();
            tracing::warn!("debugger diagnostic output: {}", text.trim_end());
            shared
                .events
                .output(format!("stderr: {}", text.trim_end()));
            shared.kill.notify_one();
        }
        _ => {}
    }
}

/// プロセスの終了監視タスク
///
/// 終了コードを説明メッセージへ写し、待機中の呼び出しをすべて
/// 強制解決してから終了イベントを発行します。
async fn supervise(mut process: DebuggerProcess, shared: Arc<Shared>) {
    let code = tokio::select! {
        status = process.wait() => status.ok().and_then(|s| s.code()),
        _ = shared.kill.notified() => {
            process.kill().await;
            None
        }
    };

    let cause = BridgeError::UnexpectedExit(code);
    tracing::info!("{}", cause);
    shared.events.output(cause.to_string());
    shutdown(&shared);
}

/// セッションを終端状態へ落とす（終了・プロトコル逸脱の共通経路）
fn shutdown(shared: &Shared) {
    shared.alive.store(false, Ordering::SeqCst);
    {
        let mut inner = shared.inner.lock().unwrap();
        inner.session.abort_all();
    }
    shared.gate.release("<debugger exited>");
    shared.events.terminated();
}

/// 1チャンク分の分類とディスパッチ
fn handle_reply(shared: &Shared, text: &str) {
    match shared.classifier.classify(text) {
        Ok(Some(action)) => apply_action(shared, action),
        Ok(None) => tracing::trace!("dropped reply: {}", text.trim_end()),
        Err(e) => {
            // 再同期点が定義されていないため、逸脱はここで打ち切る
            tracing::warn!("protocol drift, ending session: {}", e);
            shared.kill.notify_one();
            shutdown(shared);
        }
    }
}

/// 分類結果を状態とイベントへ反映する
fn apply_action(shared: &Shared, action: Action) {
    match action {
        Action::SessionNotFound { message } => {
            // セッションは待機状態のまま生かしておく
            tracing::warn!("{}", message);
            shared.events.output(message);
        }
        Action::ThreadCreated { thread_id } => {
            tracing::info!(thread_id, "attach acknowledged");
            shared.events.output(format!("[New Thread {}]", thread_id));
        }
        Action::FrameSelected => {}
        Action::EvaluateResult { value } => {
            let mut inner = shared.inner.lock().unwrap();
            inner
                .session
                .resolve(ResponseChannel::Evaluate, ReplyValue::Scalar(value));
        }
        Action::StackPayload { frames } => {
            let mut inner = shared.inner.lock().unwrap();
            inner
                .session
                .resolve(ResponseChannel::Stack, ReplyValue::Frames(frames));
        }
        Action::VariablesPayload { scope, variables } => {
            let mut inner = shared.inner.lock().unwrap();
            inner
                .session
                .resolve(scope.channel(), ReplyValue::Variables(variables));
        }
        Action::UnrecognizedPayload => {
            tracing::debug!("structured payload without a known key");
        }
        Action::BreakpointConfirmed { id, file, line } => {
            let confirmed = {
                let mut inner = shared.inner.lock().unwrap();
                inner.registry.mark_confirmed(&file, line, id)
            };
            if let Some(bp) = confirmed {
                shared.events.emit(DebugEvent::BreakpointValidated {
                    id: bp.id(),
                    verified: bp.verified,
                });
            }
        }
        Action::BreakpointHit {
            id,
            procedure,
            file,
            line,
        } => {
            {
                let mut inner = shared.inner.lock().unwrap();
                inner.session.set_stop_location(StopLocation {
                    breakpoint_id: Some(id),
                    procedure,
                    file,
                    line,
                });
            }
            shared.events.emit(DebugEvent::StoppedBreakpoint);
        }
        Action::SteppedTo { file, line } => {
            {
                let mut inner = shared.inner.lock().unwrap();
                let procedure = inner.session.stop_location().procedure.clone();
                inner.session.set_stop_location(StopLocation {
                    breakpoint_id: None,
                    procedure,
                    file,
                    line,
                });
            }
            shared.events.emit(DebugEvent::StoppedBreakpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared_with_events() -> (Arc<Shared>, mpsc::UnboundedReceiver<DebugEvent>) {
        let (events, rx) = EventBus::new();
        let shared = SodiumBridge::new_shared(None, PathSanitizer::default(), events).unwrap();
        (shared, rx)
    }

    #[tokio::test]
    async fn test_breakpoint_confirmed_emits_validated_event() {
        let (shared, mut rx) = test_shared_with_events();
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.registry.set("main.sqlx", 6);
        }
        handle_reply(&shared, "7 at 0x0000:  file main.sqlx, line 6.\r\n");
        assert_eq!(
            rx.try_recv().unwrap(),
            DebugEvent::BreakpointValidated {
                id: 7,
                verified: true
            }
        );
    }

    #[tokio::test]
    async fn test_confirmation_for_unknown_location_is_inert() {
        let (shared, mut rx) = test_shared_with_events();
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.registry.set("main.sqlx", 6);
        }
        handle_reply(&shared, "7 at 0x0000:  file main.sqlx, line 9.\r\n");
        assert!(rx.try_recv().is_err());
        let inner = shared.inner.lock().unwrap();
        assert_eq!(inner.registry.locations_at("main.sqlx"), vec![6]);
    }

    #[tokio::test]
    async fn test_breakpoint_hit_updates_stop_location() {
        let (shared, mut rx) = test_shared_with_events();
        handle_reply(&shared, "Breakpoint 7, proc() at main.sqlx:6\r\n");
        assert_eq!(rx.try_recv().unwrap(), DebugEvent::StoppedBreakpoint);
        let inner = shared.inner.lock().unwrap();
        let stop = inner.session.stop_location();
        assert_eq!(stop.breakpoint_id, Some(7));
        assert_eq!(stop.procedure, "proc()");
        assert_eq!(stop.file, "main.sqlx");
        assert_eq!(stop.line, 6);
    }

    #[tokio::test]
    async fn test_session_not_found_keeps_session_alive() {
        let (shared, mut rx) = test_shared_with_events();
        handle_reply(&shared, "No session found with id: 99999 !\r\n");
        assert!(matches!(
            rx.try_recv().unwrap(),
            DebugEvent::Output { .. }
        ));
        assert!(shared.alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_protocol_drift_shuts_the_session_down() {
        let (shared, mut rx) = test_shared_with_events();
        handle_reply(&shared, r#"{"locals": [broken}"#);
        assert!(!shared.alive.load(Ordering::SeqCst));
        assert_eq!(rx.try_recv().unwrap(), DebugEvent::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_force_resolves_pending_slots() {
        let (shared, _events) = test_shared_with_events();
        let rx = {
            let mut inner = shared.inner.lock().unwrap();
            inner.session.bind(ResponseChannel::Stack)
        };
        shutdown(&shared);
        assert!(rx.await.is_err());
    }
}
