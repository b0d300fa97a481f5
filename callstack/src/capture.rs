// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Capturing the current thread's call stack.

use crate::cache::SymbolCache;

/// The most frames a [`StackCapture`] will hold. Deeper stacks are
/// silently truncated.
pub const MAX_FRAMES: usize = 128;

/// Walks a call stack, reporting raw return addresses innermost first.
///
/// The walk stops early when the callback returns `false`. The real
/// implementation is [`SystemWalker`]; tests substitute synthetic walks.
pub trait StackWalker {
    fn walk(&self, f: &mut dyn FnMut(u64) -> bool);
}

/// A [`StackWalker`] backed by the system unwinder.
#[derive(Debug, Default)]
pub struct SystemWalker;

impl StackWalker for SystemWalker {
    fn walk(&self, f: &mut dyn FnMut(u64) -> bool) {
        backtrace::trace(|frame| f(frame.ip() as usize as u64));
    }
}

/// A bounded, immutable record of one thread's call stack.
///
/// Captures hold at most [`MAX_FRAMES`] addresses, innermost frame first.
/// No symbolication happens here; each address is recorded in the
/// [`SymbolCache`] so its module facts are pinned down while the process
/// is still running, and everything else waits for the offline resolve
/// pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackCapture {
    addrs: Vec<u64>,
}

impl StackCapture {
    /// Capture the calling thread's stack.
    ///
    /// Cheap enough for hot paths: one bounded walk plus a cache hit per
    /// previously-seen address. Must not block, so it is safe to call with
    /// other locks held.
    pub fn capture(walker: &dyn StackWalker, cache: &SymbolCache) -> StackCapture {
        let mut addrs = Vec::with_capacity(MAX_FRAMES);
        walker.walk(&mut |addr| {
            addrs.push(addr);
            addrs.len() < MAX_FRAMES
        });
        for &addr in &addrs {
            cache.record_if_absent(addr);
        }
        StackCapture { addrs }
    }

    /// Rebuild a capture from addresses recorded elsewhere, without walking
    /// anything. Truncates at [`MAX_FRAMES`] like `capture` does.
    pub fn from_addresses(addrs: &[u64]) -> StackCapture {
        let len = addrs.len().min(MAX_FRAMES);
        StackCapture {
            addrs: addrs[..len].to_vec(),
        }
    }

    /// Number of frames captured.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The captured addresses, innermost frame first.
    pub fn addresses(&self) -> &[u64] {
        &self.addrs
    }
}

impl<'a> IntoIterator for &'a StackCapture {
    type Item = &'a u64;
    type IntoIter = std::slice::Iter<'a, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::NullLookup;

    /// Reports `count` made-up frames.
    struct DeepWalker {
        count: usize,
    }

    impl StackWalker for DeepWalker {
        fn walk(&self, f: &mut dyn FnMut(u64) -> bool) {
            for i in 0..self.count {
                if !f(0x1000 + i as u64) {
                    break;
                }
            }
        }
    }

    #[test]
    fn test_capture_truncates_deep_stacks() {
        let cache = SymbolCache::new(NullLookup);
        let stack = StackCapture::capture(&DeepWalker { count: 500 }, &cache);

        assert_eq!(stack.len(), MAX_FRAMES);
        assert_eq!(stack.addresses()[0], 0x1000);
        assert_eq!(stack.addresses()[MAX_FRAMES - 1], 0x1000 + 127);
    }

    #[test]
    fn test_capture_records_into_cache() {
        let cache = SymbolCache::new(NullLookup);
        let stack = StackCapture::capture(&DeepWalker { count: 5 }, &cache);

        assert_eq!(stack.len(), 5);
        assert_eq!(cache.len(), 5);

        // A second capture of the same addresses adds nothing new.
        StackCapture::capture(&DeepWalker { count: 5 }, &cache);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_from_addresses_truncates() {
        let many: Vec<u64> = (0..200).collect();
        let stack = StackCapture::from_addresses(&many);
        assert_eq!(stack.len(), MAX_FRAMES);
        assert_eq!(stack.addresses(), &many[..MAX_FRAMES]);

        let few = [1u64, 2, 3];
        assert_eq!(StackCapture::from_addresses(&few).addresses(), &few);
    }

    #[test]
    fn test_system_walker_sees_this_frame() {
        let cache = SymbolCache::new(NullLookup);
        let stack = StackCapture::capture(&SystemWalker, &cache);
        assert!(!stack.is_empty());
        assert!(stack.len() <= MAX_FRAMES);
    }
}
