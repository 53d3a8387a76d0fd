//! Priority-ordered intrusive doubly-linked list (C3)
//!
//! Every scheduler and primitive waiter list (ready queue, semaphore/mutex/
//! condvar/message-queue/signal-wait waiters) is one of these. Grounded on
//! the teacher's `utils::intrusive_list`/`wait::WaitQueue::find_insertion_position`,
//! adapted to the arena-with-stable-index model: nodes are identified by
//! [`TaskId`] and their prev/next pointers live in [`crate::task::Link`]
//! rather than behind raw pointers.
use crate::{
    klock::CriticalTokenRefMut,
    kernel_traits::KernelTraits,
    task::{Link, ListTag, TaskId},
};

fn task<Traits: KernelTraits>(id: TaskId) -> &'static crate::task::TaskCb<Traits> {
    &Traits::task_pool()[id.index()]
}

/// Head of a priority-ordered intrusive list. The list itself stores only
/// the head pointer; membership and ordering live in each task's [`Link`].
#[derive(Debug)]
pub(crate) struct List {
    head: Option<TaskId>,
}

impl List {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub(crate) fn front(&self) -> Option<TaskId> {
        self.head
    }

    /// Insert `id` preserving invariant 3 (§3): placed immediately before
    /// the first node with strictly lower effective priority, i.e. after any
    /// existing nodes of equal-or-higher priority (FIFO among ties).
    pub(crate) fn insert<Traits: KernelTraits>(
        &mut self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        tag: ListTag,
        id: TaskId,
    ) {
        let pri = task::<Traits>(id).effective_priority(&*tok);

        let mut cursor = self.head;
        let mut prev: Option<TaskId> = None;
        while let Some(cur) = cursor {
            let cur_pri = task::<Traits>(cur).effective_priority(&*tok);
            if cur_pri < pri {
                break;
            }
            prev = Some(cur);
            cursor = task::<Traits>(cur).link.read(&**tok).next;
        }

        task::<Traits>(id).link.replace(
            &mut **tok,
            Link {
                prev,
                next: cursor,
                tag,
            },
        );

        if let Some(prev) = prev {
            let mut l = *task::<Traits>(prev).link.read(&**tok);
            l.next = Some(id);
            task::<Traits>(prev).link.replace(&mut **tok, l);
        } else {
            self.head = Some(id);
        }

        if let Some(next) = cursor {
            let mut l = *task::<Traits>(next).link.read(&**tok);
            l.prev = Some(id);
            task::<Traits>(next).link.replace(&mut **tok, l);
        }
    }

    /// Unlink `id`. No-op assertions: `id` must currently be a member of
    /// this exact list (checked via the [`ListTag`] in debug builds only;
    /// the doubly-linked splice itself doesn't need to know the tag).
    pub(crate) fn remove<Traits: KernelTraits>(
        &mut self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        id: TaskId,
    ) {
        let link = *task::<Traits>(id).link.read(&**tok);

        match link.prev {
            Some(prev) => {
                let mut l = *task::<Traits>(prev).link.read(&**tok);
                l.next = link.next;
                task::<Traits>(prev).link.replace(&mut **tok, l);
            }
            None => self.head = link.next,
        }

        if let Some(next) = link.next {
            let mut l = *task::<Traits>(next).link.read(&**tok);
            l.prev = link.prev;
            task::<Traits>(next).link.replace(&mut **tok, l);
        }

        task::<Traits>(id).link.replace(
            &mut **tok,
            Link {
                prev: None,
                next: None,
                tag: ListTag::None,
            },
        );
    }

    /// Re-splice `id` to its new priority-ordered position. Used whenever a
    /// linked task's effective priority changes (§4.2).
    pub(crate) fn reorder<Traits: KernelTraits>(
        &mut self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
        id: TaskId,
    ) {
        let tag = task::<Traits>(id).link.read(&**tok).tag;
        self.remove::<Traits>(tok, id);
        self.insert::<Traits>(tok, tag, id);
    }

    /// Pop and return the highest-priority (front) member, if any.
    pub(crate) fn pop_front<Traits: KernelTraits>(
        &mut self,
        tok: &mut CriticalTokenRefMut<'_, Traits>,
    ) -> Option<TaskId> {
        let front = self.head?;
        self.remove::<Traits>(tok, front);
        Some(front)
    }

    /// Iterate the list front-to-back without mutating it.
    pub(crate) fn iter<'a, Traits: KernelTraits>(
        &'a self,
        tok: &'a CriticalTokenRefMut<'a, Traits>,
    ) -> ListIter<'a, Traits> {
        ListIter {
            cur: self.head,
            tok,
        }
    }
}

pub(crate) struct ListIter<'a, Traits: KernelTraits> {
    cur: Option<TaskId>,
    tok: &'a CriticalTokenRefMut<'a, Traits>,
}

impl<'a, Traits: KernelTraits> Iterator for ListIter<'a, Traits> {
    type Item = TaskId;
    fn next(&mut self) -> Option<TaskId> {
        let cur = self.cur?;
        self.cur = task::<Traits>(cur).link.read(&**self.tok).next;
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    // `insert`/`reorder` need a live `CriticalTokenRefMut` over a real task
    // pool to touch `TaskCb::link`, which means a running scheduler; the
    // priority-ordered, FIFO-among-ties placement this module exists for is
    // exercised end-to-end by the ready/waiter-list behavior in S1 and S2 of
    // `tests/scenarios.rs`.
}
