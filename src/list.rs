use std::{marker::PhantomData, ptr::NonNull};

use crate::{header::Header, Pointer};

/// Linked list node. See also [`Header<T>`].
pub struct Node<T> {
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
    pub data: T,
}

/// Intrusive doubly linked list used to chain chunks together. Nodes live
/// inside the memory they describe, at the very beginning of each mapped
/// chunk, so the list itself never allocates. That's important because,
/// well, we are the allocator.
///
/// ```text
///          +-------+------------+      +-------+------------+      +-------+------------+
/// head --> | Node  |  payload   | <--> | Node  |  payload   | <--> | Node  |  payload   | <-- tail
///          +-------+------------+      +-------+------------+      +-------+------------+
/// ```
pub struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    /// Creates an empty linked list. No allocations happen.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First node, if any.
    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    /// Appends a new node to the linked list. Since it cannot do allocations
    /// it needs the address where the node should be written to.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` is valid, aligned for
    /// [`Node<T>`] and not aliased by anything else.
    ///
    /// # Arguments
    ///
    /// * `data` - The data that the new node will hold.
    ///
    /// * `address` - Memory address where the new node will be written.
    pub unsafe fn append(&mut self, data: T, address: NonNull<u8>) -> NonNull<Header<T>> {
        let node = address.cast::<Node<T>>();

        node.as_ptr().write(Node {
            prev: self.tail,
            next: None,
            data,
        });

        if let Some(mut tail) = self.tail {
            tail.as_mut().next = Some(node);
        } else {
            self.head = Some(node);
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Removes `node` from the linked list. The memory where `node` lives is
    /// not touched apart from its links, releasing it is up to the caller.
    ///
    /// # Safety
    ///
    /// `node` must be valid and belong to this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        let prev = node.as_ref().prev;
        let next = node.as_ref().next;

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }

        match next {
            Some(mut next) => next.as_mut().prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// Iterates over the node pointers from head to tail. Nodes must not be
    /// removed while the iterator is alive, collect them first if needed.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

/// See [`LinkedList::iter`].
pub struct Iter<'a, T> {
    current: Pointer<Node<T>>,
    marker: PhantomData<&'a LinkedList<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.current.map(|node| {
            // SAFETY: Nodes stay valid as long as the list is borrowed.
            self.current = unsafe { node.as_ref().next };
            node
        })
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;

    #[test]
    fn append_iterate_remove() {
        // Node storage on the stack, the list doesn't care where nodes live.
        let mut storage: [MaybeUninit<Node<u32>>; 3] = [
            MaybeUninit::uninit(),
            MaybeUninit::uninit(),
            MaybeUninit::uninit(),
        ];
        let mut list = LinkedList::<u32>::new();

        unsafe {
            let nodes: Vec<_> = storage
                .iter_mut()
                .enumerate()
                .map(|(i, slot)| list.append(i as u32, NonNull::from(slot).cast()))
                .collect();

            assert_eq!(list.len(), 3);
            let values: Vec<u32> = list.iter().map(|node| node.as_ref().data).collect();
            assert_eq!(values, [0, 1, 2]);

            // Remove from the middle.
            list.remove(nodes[1]);
            let values: Vec<u32> = list.iter().map(|node| node.as_ref().data).collect();
            assert_eq!(values, [0, 2]);
            assert_eq!(nodes[0].as_ref().next, Some(nodes[2]));
            assert_eq!(nodes[2].as_ref().prev, Some(nodes[0]));

            list.remove(nodes[0]);
            assert_eq!(list.head, Some(nodes[2]));
            list.remove(nodes[2]);
            assert!(list.is_empty());
            assert_eq!(list.head, None);
            assert_eq!(list.tail, None);
        }
    }
}
