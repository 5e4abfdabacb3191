//! 会话身份缓存模块
//!
//! 该模块按（段、事务、有效用户）缓存身份对象并进行引用计数。
//! 引用计数降为零的条目进入所属段的过期队列，在 TTL 之后的某次缓存操作中被
//! 惰性清理；段的最后一个分片可以要求立即清理该段所有未被引用的条目。
//!
//! 身份的创建与销毁都在缓存锁之外进行：正在创建的键以占位槽标记，
//! 同一键的并发请求在条件变量上等待，从而保证每个键只创建一次。

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fedgate_common::{Error, Result, SessionKey};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::provider::{IdentityHandle, IdentityProvider};

/// 默认身份缓存有效期（15 分钟）
pub const DEFAULT_IDENTITY_TTL: Duration = Duration::from_secs(15 * 60);

/// 缓存条目
#[derive(Debug)]
struct IdentityCacheEntry {
    /// 身份对象，销毁由缓存负责
    identity: IdentityHandle,
    /// 正在使用该身份的请求数
    ref_count: usize,
    /// 最近一次引用计数归零时的序号，用于识别过期队列中的陈旧记录
    release_stamp: u64,
}

impl IdentityCacheEntry {
    fn new(identity: IdentityHandle) -> Self {
        Self {
            identity,
            ref_count: 1,
            release_stamp: 0,
        }
    }
}

/// 缓存槽位
#[derive(Debug)]
enum Slot {
    /// 身份正在创建
    Constructing,
    /// 身份可用
    Ready(IdentityCacheEntry),
}

/// 过期队列记录
#[derive(Debug)]
struct ExpirationRecord {
    /// 为空表示有效期超出时钟范围，永不到期
    expires_at: Option<Instant>,
    stamp: u64,
    key: SessionKey,
}

impl PartialEq for ExpirationRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ExpirationRecord {}

impl PartialOrd for ExpirationRecord {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpirationRecord {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let deadline = match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        deadline.then(self.stamp.cmp(&other.stamp))
    }
}

impl ExpirationRecord {
    fn is_due(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// 按过期时间排序的最小堆
type ExpirationQueue = BinaryHeap<Reverse<ExpirationRecord>>;

/// 从缓存中移除、等待销毁的身份
type Doomed = Vec<(SessionKey, IdentityHandle)>;

/// 受缓存锁保护的状态
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<SessionKey, Slot>,
    /// 每个段一个过期队列
    queues: HashMap<i32, ExpirationQueue>,
    next_stamp: u64,
}

impl CacheState {
    /// 递减引用计数，归零时放入过期队列；返回剩余引用数
    fn release(&mut self, key: &SessionKey, expires_at: Option<Instant>) -> Result<usize> {
        let entry = match self.entries.get_mut(key) {
            Some(Slot::Ready(entry)) if entry.ref_count > 0 => entry,
            _ => return Err(Error::NotInCache(key.clone())),
        };

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            self.next_stamp += 1;
            entry.release_stamp = self.next_stamp;
            self.queues
                .entry(key.segment_id)
                .or_default()
                .push(Reverse(ExpirationRecord {
                    expires_at,
                    stamp: self.next_stamp,
                    key: key.clone(),
                }));
        }
        Ok(entry.ref_count)
    }

    /// 清理所有段中已过期的条目
    fn sweep_expired(&mut self, now: Instant) -> Doomed {
        self.sweep_all(now, false)
    }

    /// 遍历所有段的过期队列，移除清空的队列
    fn sweep_all(&mut self, now: Instant, force: bool) -> Doomed {
        let mut doomed = Vec::new();
        let entries = &mut self.entries;
        self.queues.retain(|_, queue| {
            sweep_queue(entries, queue, now, force, &mut doomed);
            !queue.is_empty()
        });
        doomed
    }

    /// 清理单个段的过期队列
    fn sweep_segment(&mut self, segment_id: i32, now: Instant, force: bool, doomed: &mut Doomed) {
        let Some(queue) = self.queues.get_mut(&segment_id) else {
            return;
        };
        sweep_queue(&mut self.entries, queue, now, force, doomed);
        if queue.is_empty() {
            self.queues.remove(&segment_id);
        }
    }

    fn size(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}

/// 扫描一个过期队列
///
/// 陈旧记录（条目已被重新获取、已被移除或已有更新的记录）直接丢弃并继续扫描；
/// 遇到第一个仍然有效且未到期的记录时停止。`force` 为真时不看过期时间，
/// 清理该队列中所有未被引用的条目。
fn sweep_queue(
    entries: &mut HashMap<SessionKey, Slot>,
    queue: &mut ExpirationQueue,
    now: Instant,
    force: bool,
    doomed: &mut Doomed,
) {
    loop {
        let (live, due) = match queue.peek() {
            Some(Reverse(record)) => match entries.get(&record.key) {
                Some(Slot::Ready(entry)) if entry.ref_count == 0 && entry.release_stamp == record.stamp => {
                    (true, record.is_due(now))
                }
                _ => (false, false),
            },
            None => break,
        };

        if live && !due && !force {
            break;
        }

        let Some(Reverse(record)) = queue.pop() else {
            break;
        };
        if !live {
            continue;
        }
        if let Some(Slot::Ready(entry)) = entries.remove(&record.key) {
            doomed.push((record.key, entry.identity));
        }
    }
}

/// 缓存统计计数器
#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    constructions: AtomicU64,
    destroyed: AtomicU64,
    destroy_failures: AtomicU64,
}

/// 缓存统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// 当前条目数
    pub entries: usize,
    /// 过期队列中的记录数（含陈旧记录）
    pub queued: usize,
    /// 复用已缓存身份的次数
    pub hits: u64,
    /// 需要创建新身份的次数
    pub misses: u64,
    /// 成功创建的身份数
    pub constructions: u64,
    /// 成功销毁的身份数
    pub destroyed: u64,
    /// 销毁失败的身份数
    pub destroy_failures: u64,
}

/// 会话身份缓存
pub struct IdentityCache {
    /// 身份提供方
    provider: Arc<dyn IdentityProvider>,
    /// 时间源
    clock: Arc<dyn Clock>,
    /// 未被引用条目的有效期
    ttl: Duration,
    /// 缓存状态
    state: Mutex<CacheState>,
    /// 身份创建完成的通知
    constructed: Condvar,
    /// 统计计数
    stats: StatsCounters,
}

impl IdentityCache {
    /// 创建新的身份缓存
    pub fn new(provider: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            provider,
            clock,
            ttl,
            state: Mutex::new(CacheState::default()),
            constructed: Condvar::new(),
            stats: StatsCounters::default(),
        }
    }

    /// 获取会话对应的身份，引用计数加一
    ///
    /// 不存在时通过身份提供方创建：`impersonate` 为真时创建代理身份，
    /// 否则创建远程用户身份。提供方的错误原样返回，且不会留下缓存条目。
    pub fn acquire(
        &self,
        key: &SessionKey,
        login: &IdentityHandle,
        impersonate: bool,
        kerberos_enabled: bool,
    ) -> Result<IdentityHandle> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let doomed = state.sweep_expired(now);

        loop {
            match state.entries.get_mut(key) {
                Some(Slot::Ready(entry)) => {
                    entry.ref_count += 1;
                    let identity = entry.identity.clone();
                    let ref_count = entry.ref_count;
                    drop(state);

                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("复用缓存身份 {}，引用计数: {}", key, ref_count);
                    self.destroy_all(doomed);
                    return Ok(identity);
                }
                Some(Slot::Constructing) => self.constructed.wait(&mut state),
                None => break,
            }
        }

        state.entries.insert(key.clone(), Slot::Constructing);
        drop(state);
        self.destroy_all(doomed);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let pending = PendingConstruction::new(self, key);
        let created = if impersonate {
            debug!("为 {} 创建代理身份", key);
            self.provider.create_proxy_identity(&key.effective_user, login)
        } else {
            debug!("为 {} 创建远程用户身份", key);
            self.provider
                .create_remote_identity(&key.effective_user, login, kerberos_enabled)
        };
        pending.finish(&created);
        created
    }

    /// 释放会话引用，引用计数减一
    ///
    /// `force_cleanup` 为真时立即清理同一段中所有未被引用的条目，
    /// 不影响其他段。
    pub fn release(&self, key: &SessionKey, force_cleanup: bool) -> Result<()> {
        let now = self.clock.now();
        // 有效期超出时钟范围时条目只能被强制清理
        let expires_at = now.checked_add(self.ttl);
        let mut state = self.state.lock();
        let remaining = state.release(key, expires_at)?;
        debug!("释放会话 {}，剩余引用: {}", key, remaining);

        let mut doomed = Vec::new();
        if force_cleanup {
            state.sweep_segment(key.segment_id, now, true, &mut doomed);
        }
        drop(state);

        self.destroy_all(doomed);
        Ok(())
    }

    /// 执行一次惰性清理，返回被销毁的身份数
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let doomed = self.state.lock().sweep_expired(now);
        let count = doomed.len();
        self.destroy_all(doomed);

        if count > 0 {
            info!("身份缓存清理完成，移除 {} 个条目，当前条目数: {}", count, self.size());
        }
        count
    }

    /// 销毁所有未被引用的条目，返回被销毁的身份数
    pub fn drain(&self) -> usize {
        let now = self.clock.now();
        let doomed = self.state.lock().sweep_all(now, true);
        let count = doomed.len();
        self.destroy_all(doomed);
        count
    }

    /// 当前缓存条目数
    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    /// 缓存中是否存在该会话
    pub fn contains(&self, key: &SessionKey) -> bool {
        matches!(self.state.lock().entries.get(key), Some(Slot::Ready(_)))
    }

    /// 所有过期队列中的记录数
    pub fn queued_len(&self) -> usize {
        self.state.lock().queues.values().map(BinaryHeap::len).sum()
    }

    /// 统计快照
    pub fn stats(&self) -> CacheStats {
        let (entries, queued) = {
            let state = self.state.lock();
            (state.size(), state.queues.values().map(BinaryHeap::len).sum())
        };
        CacheStats {
            entries,
            queued,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            constructions: self.stats.constructions.load(Ordering::Relaxed),
            destroyed: self.stats.destroyed.load(Ordering::Relaxed),
            destroy_failures: self.stats.destroy_failures.load(Ordering::Relaxed),
        }
    }

    fn destroy_all(&self, doomed: Doomed) {
        for (key, identity) in doomed {
            match self.provider.destroy(&identity) {
                Ok(()) => {
                    self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                    debug!("已销毁身份 {}", key);
                }
                Err(e) => {
                    self.stats.destroy_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("销毁身份 {} 失败，条目已移除: {}", key, e);
                }
            }
        }
    }
}

/// 正在创建的槽位
///
/// 创建结束后写入结果并唤醒等待者；若创建过程中发生 panic，
/// 在 drop 时移除占位槽，避免等待者永久阻塞。
struct PendingConstruction<'a> {
    cache: &'a IdentityCache,
    key: &'a SessionKey,
    finished: bool,
}

impl<'a> PendingConstruction<'a> {
    fn new(cache: &'a IdentityCache, key: &'a SessionKey) -> Self {
        Self {
            cache,
            key,
            finished: false,
        }
    }

    fn finish(mut self, created: &Result<IdentityHandle>) {
        {
            let mut state = self.cache.state.lock();
            match created {
                Ok(identity) => {
                    state
                        .entries
                        .insert(self.key.clone(), Slot::Ready(IdentityCacheEntry::new(identity.clone())));
                    self.cache.stats.constructions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    state.entries.remove(self.key);
                    debug!("为 {} 创建身份失败: {}", self.key, e);
                }
            }
        }
        self.finished = true;
        self.cache.constructed.notify_all();
    }
}

impl Drop for PendingConstruction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.state.lock().entries.remove(self.key);
            self.cache.constructed.notify_all();
        }
    }
}

/// 创建默认的身份缓存
pub fn create_default_cache(provider: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>) -> IdentityCache {
    IdentityCache::new(provider, clock, DEFAULT_IDENTITY_TTL)
}
