use std::collections::VecDeque;
use std::thread::{self, Thread};

use spin::{Mutex, MutexGuard};

/// 条件变量：挂起的线程排在等待队列里，由 [`Condvar::notify_all`] 全部唤醒。
///
/// 被唤醒的线程须重新检查等待条件。
pub struct Condvar {
    wait_queue: Mutex<VecDeque<Thread>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            wait_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn notify_all(&self) {
        while let Some(thread) = self.wait_queue.lock().pop_front() {
            thread.unpark();
        }
    }

    /// 释放 `guard`，挂起直到被唤醒，再重新加锁
    pub fn wait<'a, T>(&self, mutex: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        // 先入队再解锁，唤醒不会丢失
        self.wait_queue.lock().push_back(thread::current());
        drop(guard);
        thread::park();
        mutex.lock()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
