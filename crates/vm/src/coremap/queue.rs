//! FIFO 所有权队列
//!
//! 以帧号为下标的数组实现的双向链表，`head` 最早分配，`tail` 最新分配。
//! 链接用 `Option<usize>` 表示，`None` 即“没有”。
//! 入队、出队、从任意位置摘除都是 O(1)。

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    queued: bool,
}

/// FIFO 所有权队列
#[derive(Debug, Default)]
pub struct OwnershipQueue {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl OwnershipQueue {
    /// 可容纳 `capacity` 个帧的空队列
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            links: alloc::vec![Link::default(); capacity],
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// 队列长度
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 最早入队的帧
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// 最晚入队的帧
    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// 帧是否在队列中
    pub fn contains(&self, index: usize) -> bool {
        self.links.get(index).is_some_and(|l| l.queued)
    }

    /// 追加到队尾
    pub fn push_back(&mut self, index: usize) {
        debug_assert!(!self.links[index].queued, "frame {} queued twice", index);
        self.links[index] = Link {
            prev: self.tail,
            next: None,
            queued: true,
        };
        match self.tail {
            Some(tail) => self.links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// 取出队首
    pub fn pop_front(&mut self) -> Option<usize> {
        let head = self.head?;
        self.unlink(head);
        Some(head)
    }

    /// 从队列中摘除 `index`
    ///
    /// 分别处理只有一个元素、队首、队尾和中间四种情况。
    /// 不在队列中时返回 `false`。
    pub fn unlink(&mut self, index: usize) -> bool {
        if !self.contains(index) {
            return false;
        }
        let Link { prev, next, .. } = self.links[index];
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[index] = Link::default();
        self.len -= 1;
        true
    }

    /// 从队首到队尾遍历
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.head, move |&i| self.links[i].next)
    }
}
