//! Singly-linked task lists
//!
//! Tasks are linked by index into the task pool. A task control block has
//! three independent link fields, so a task can be a member of one ready or
//! wait list, the suspended list, and the global task list at the same time.
//! [`TaskListAccessor`] abstracts over the head and link storage so that the
//! list algorithms can be tested without a kernel.
//!
//! None of these functions lock anything. The caller serializes access,
//! usually by holding a CPU Lock token.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    Kernel, KernelCfg,
};

/// The index of a task control block in [`KernelCfg::TaskPool`].
pub(crate) type TaskIdx = usize;

/// Provides access to a list's head and to the links and priorities of its
/// elements.
pub(crate) trait TaskListAccessor {
    fn head(&self) -> Option<TaskIdx>;
    fn set_head(&mut self, head: Option<TaskIdx>);
    fn next(&self, task: TaskIdx) -> Option<TaskIdx>;
    fn set_next(&mut self, task: TaskIdx, next: Option<TaskIdx>);
    fn priority(&self, task: TaskIdx) -> u8;
}

/// Append `task` to the end of the list.
pub(crate) fn add_to_end(list: &mut impl TaskListAccessor, task: TaskIdx) {
    list.set_next(task, None);

    let Some(mut cur) = list.head() else {
        list.set_head(Some(task));
        return;
    };

    while let Some(next) = list.next(cur) {
        cur = next;
    }
    list.set_next(cur, Some(task));
}

/// Insert `task` before the first element having a strictly lower priority.
/// The list stays sorted by descending priority, and a new element is placed
/// after the existing elements of the same priority.
pub(crate) fn add_high_priority(list: &mut impl TaskListAccessor, task: TaskIdx) {
    let pri = list.priority(task);

    let mut prev = None;
    let mut cur = list.head();
    while let Some(c) = cur {
        if list.priority(c) < pri {
            break;
        }
        prev = Some(c);
        cur = list.next(c);
    }

    list.set_next(task, cur);
    match prev {
        Some(prev) => list.set_next(prev, Some(task)),
        None => list.set_head(Some(task)),
    }
}

/// Insert `task` at the front of the list.
pub(crate) fn push_front(list: &mut impl TaskListAccessor, task: TaskIdx) {
    let head = list.head();
    list.set_next(task, head);
    list.set_head(Some(task));
}

/// Unlink `task` from the list. Returns `false` if it's not a member.
pub(crate) fn remove(list: &mut impl TaskListAccessor, task: TaskIdx) -> bool {
    let mut prev = None;
    let mut cur = list.head();
    while let Some(c) = cur {
        if c == task {
            let next = list.next(c);
            match prev {
                Some(prev) => list.set_next(prev, next),
                None => list.set_head(next),
            }
            list.set_next(c, None);
            return true;
        }
        prev = Some(c);
        cur = list.next(c);
    }
    false
}

/// Detach and return the first element.
pub(crate) fn pop(list: &mut impl TaskListAccessor) -> Option<TaskIdx> {
    let head = list.head()?;
    let next = list.next(head);
    list.set_head(next);
    list.set_next(head, None);
    Some(head)
}

/// Selects one of the link fields of [`TaskCb`](crate::TaskCb).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// Ready list or wait list.
    Next,
    /// The suspended list.
    Suspended,
    /// The global task list.
    Global,
}

/// [`TaskListAccessor`] for lists of kernel tasks.
pub(crate) struct TaskList<'a, Traits: KernelCfg> {
    kernel: &'static Kernel<Traits>,
    lock: CpuLockTokenRefMut<'a, Traits>,
    head: &'a CpuLockCell<Traits, Option<TaskIdx>>,
    link: Link,
}

impl<'a, Traits: KernelCfg> TaskList<'a, Traits> {
    pub(crate) fn new(
        kernel: &'static Kernel<Traits>,
        lock: CpuLockTokenRefMut<'a, Traits>,
        head: &'a CpuLockCell<Traits, Option<TaskIdx>>,
        link: Link,
    ) -> Self {
        Self {
            kernel,
            lock,
            head,
            link,
        }
    }

    fn link_cell(&self, task: TaskIdx) -> &'static CpuLockCell<Traits, Option<TaskIdx>> {
        let cb = self.kernel.task_cb(task);
        match self.link {
            Link::Next => &cb.next,
            Link::Suspended => &cb.suspended_next,
            Link::Global => &cb.global_next,
        }
    }
}

impl<Traits: KernelCfg> TaskListAccessor for TaskList<'_, Traits> {
    fn head(&self) -> Option<TaskIdx> {
        self.head.get(&*self.lock)
    }

    fn set_head(&mut self, head: Option<TaskIdx>) {
        self.head.replace(&mut *self.lock, head);
    }

    fn next(&self, task: TaskIdx) -> Option<TaskIdx> {
        self.link_cell(task).get(&*self.lock)
    }

    fn set_next(&mut self, task: TaskIdx, next: Option<TaskIdx>) {
        self.link_cell(task).replace(&mut *self.lock, next);
    }

    fn priority(&self, task: TaskIdx) -> u8 {
        self.kernel.task_cb(task).priority.get(&*self.lock)
    }
}
