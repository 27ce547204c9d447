//! コマンド直列化ゲート
//!
//! テキストプロトコルには相関IDが存在しないため、「ストリーム上の次の応答」を
//! 「直前に送ったコマンドへの応答」と同義にする必要があります。このゲートは
//! 未応答のコマンドを常に高々1件に制限することでその対応関係を成立させます。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;

/// 送信許可の証跡
///
/// ゲートを獲得した呼び出し元だけがコマンドを送信できます。
/// ドロップしてもゲートは解放されません。解放は応答のディスパッチ側が
/// [`RequestGate::release`] で行います。
#[derive(Debug)]
pub struct SendTicket {
    seq: u64,
}

impl SendTicket {
    /// このチケットに対応するコマンド通番
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// 単一飛行のコマンドゲート
///
/// 獲得はFIFOであり、獲得順がそのままコマンド発行順になります。
pub struct RequestGate {
    permit: Semaphore,
    held: AtomicBool,
    issued: AtomicU64,
    replied: AtomicU64,
}

impl RequestGate {
    /// 新しいゲートを作成する
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
            held: AtomicBool::new(false),
            issued: AtomicU64::new(0),
            replied: AtomicU64::new(0),
        }
    }

    /// 未応答のコマンドが無くなるまで待機し、送信許可を得る
    pub async fn acquire(&self) -> SendTicket {
        // セマフォは閉じないので獲得は必ず成功する
        let permit = self
            .permit
            .acquire()
            .await
            .expect("request gate semaphore closed");
        permit.forget();
        self.held.store(true, Ordering::SeqCst);
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        SendTicket { seq }
    }

    /// 応答の分類・ディスパッチ完了後にゲートを解放する
    ///
    /// 獲得されていない状態での呼び出しは何もしません（no-op）。
    pub fn release(&self, raw_reply: &str) {
        if self.held.swap(false, Ordering::SeqCst) {
            let n = self.replied.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!("    > replied ({}): {}", n, raw_reply.trim_end());
            self.permit.add_permits(1);
        }
    }

    /// 未応答のコマンドが存在するか
    pub fn outstanding(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}
