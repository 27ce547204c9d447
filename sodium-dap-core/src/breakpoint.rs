//! ブレークポイント管理

use std::collections::HashMap;

/// ソースファイル上のブレークポイント
///
/// 設定時にはローカル採番の仮IDのみを持ち、デバッギからの確認応答で
/// 確定IDと検証済みフラグが与えられます。確定IDは一度割り当てられたら
/// 再割り当てされません。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SourceBreakpoint {
    pub path: String,
    pub line: u32,
    pub provisional_id: u32,
    pub confirmed_id: Option<u32>,
    pub verified: bool,
}

impl SourceBreakpoint {
    /// 消費側へ見せるID（確定済みなら確定ID、未確定なら仮ID）
    pub fn id(&self) -> u32 {
        self.confirmed_id.unwrap_or(self.provisional_id)
    }
}

/// ファイル毎のブレークポイントレジストリ
///
/// 仮IDの採番と、デバッギ採番のIDとの非同期な照合を担います。
pub struct BreakpointRegistry {
    by_file: HashMap<String, Vec<SourceBreakpoint>>,
    next_id: u32,
}

impl BreakpointRegistry {
    /// 新しいレジストリを作成する
    pub fn new() -> Self {
        Self {
            by_file: HashMap::new(),
            next_id: 1,
        }
    }

    /// 仮IDを採番して未検証のレコードを追加する
    ///
    /// 同一 (path, line) の重複は拒否しません。
    pub fn set(&mut self, path: &str, line: u32) -> SourceBreakpoint {
        let bp = SourceBreakpoint {
            path: path.to_string(),
            line,
            provisional_id: self.next_id,
            confirmed_id: None,
            verified: false,
        };
        self.next_id += 1;
        self.by_file
            .entry(path.to_string())
            .or_default()
            .push(bp.clone());
        bp
    }

    /// 指定ファイルの全レコードを削除し、削除数を返す
    pub fn clear(&mut self, path: &str) -> usize {
        self.by_file.remove(path).map(|v| v.len()).unwrap_or(0)
    }

    /// 指定 (path, line) のレコードを1件削除する
    pub fn remove(&mut self, path: &str, line: u32) -> Option<SourceBreakpoint> {
        let bps = self.by_file.get_mut(path)?;
        let index = bps.iter().position(|bp| bp.line == line)?;
        Some(bps.remove(index))
    }

    /// 指定ファイルに登録済みの行番号一覧を返す
    pub fn locations_at(&self, path: &str) -> Vec<u32> {
        self.by_file
            .get(path)
            .map(|bps| bps.iter().map(|bp| bp.line).collect())
            .unwrap_or_default()
    }

    /// デバッギ採番のIDを (file, line) の一致するレコードへ割り当てる
    ///
    /// 既に確定済みのレコードは対象外です。更新したレコードの複製を返し、
    /// 一致が無ければ何も変更しません。
    pub fn mark_confirmed(&mut self, file: &str, line: u32, id: u32) -> Option<SourceBreakpoint> {
        let bps = self.by_file.get_mut(file)?;
        for bp in bps.iter_mut() {
            if bp.line == line && bp.confirmed_id.is_none() {
                bp.confirmed_id = Some(id);
                bp.verified = true;
                return Some(bp.clone());
            }
        }
        None
    }

    /// 登録されている全レコード数
    pub fn count(&self) -> usize {
        self.by_file.values().map(|v| v.len()).sum()
    }
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_assigns_provisional_ids() {
        let mut reg = BreakpointRegistry::new();
        let a = reg.set("main.sqlx", 6);
        let b = reg.set("main.sqlx", 9);
        assert_eq!(a.provisional_id, 1);
        assert_eq!(b.provisional_id, 2);
        assert!(!a.verified);
        assert_eq!(a.confirmed_id, None);
        assert_eq!(reg.locations_at("main.sqlx"), vec![6, 9]);
    }

    #[test]
    fn test_mark_confirmed_matching_record() {
        let mut reg = BreakpointRegistry::new();
        reg.set("main.sqlx", 6);
        let confirmed = reg.mark_confirmed("main.sqlx", 6, 7).unwrap();
        assert_eq!(confirmed.confirmed_id, Some(7));
        assert!(confirmed.verified);
        assert_eq!(confirmed.id(), 7);
    }

    #[test]
    fn test_mark_confirmed_other_location_untouched() {
        let mut reg = BreakpointRegistry::new();
        reg.set("main.sqlx", 6);
        assert!(reg.mark_confirmed("main.sqlx", 7, 3).is_none());
        assert!(reg.mark_confirmed("other.sqlx", 6, 3).is_none());
        let remaining = reg.locations_at("main.sqlx");
        assert_eq!(remaining, vec![6]);
    }

    #[test]
    fn test_confirmed_id_is_never_reassigned() {
        let mut reg = BreakpointRegistry::new();
        reg.set("main.sqlx", 6);
        reg.mark_confirmed("main.sqlx", 6, 7);
        // 同じ行への2度目の確認は既存レコードを書き換えない
        assert!(reg.mark_confirmed("main.sqlx", 6, 8).is_none());
    }

    #[test]
    fn test_duplicate_locations_are_kept() {
        let mut reg = BreakpointRegistry::new();
        let a = reg.set("main.sqlx", 6);
        let b = reg.set("main.sqlx", 6);
        assert_ne!(a.provisional_id, b.provisional_id);
        assert_eq!(reg.count(), 2);

        // 確認応答は未確定のレコードへ順に割り当たる
        let first = reg.mark_confirmed("main.sqlx", 6, 7).unwrap();
        assert_eq!(first.provisional_id, a.provisional_id);
        let second = reg.mark_confirmed("main.sqlx", 6, 8).unwrap();
        assert_eq!(second.provisional_id, b.provisional_id);
    }

    #[test]
    fn test_clear_removes_all_records_for_file() {
        let mut reg = BreakpointRegistry::new();
        reg.set("main.sqlx", 6);
        reg.set("main.sqlx", 9);
        reg.set("other.sqlx", 2);
        assert_eq!(reg.clear("main.sqlx"), 2);
        assert!(reg.locations_at("main.sqlx").is_empty());
        assert_eq!(reg.locations_at("other.sqlx"), vec![2]);
    }

    #[test]
    fn test_remove_single_record() {
        let mut reg = BreakpointRegistry::new();
        reg.set("main.sqlx", 6);
        reg.set("main.sqlx", 9);
        let removed = reg.remove("main.sqlx", 6).unwrap();
        assert_eq!(removed.line, 6);
        assert_eq!(reg.locations_at("main.sqlx"), vec![9]);
        assert!(reg.remove("main.sqlx", 42).is_none());
    }
}
