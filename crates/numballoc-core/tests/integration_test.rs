//! Cross-process integration tests
//!
//! Uses fork() to run allocators in truly independent processes sharing one
//! region.

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::collections::HashSet;

    use numballoc_core::{BitmapAllocator, Memory, NumberAllocator, SharedRegion};

    fn unique_name() -> String {
        format!("/numballoc_test_{}", uuid::Uuid::new_v4().simple())
    }

    /// Check whether WaitStatus means a successful exit
    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    /// Fork a child running `f`, exiting 0 on success and 1 otherwise
    fn spawn_child<F: FnOnce() -> bool>(f: F) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
                    .unwrap_or(false);
                std::process::exit(if ok { 0 } else { 1 });
            }
            ForkResult::Parent { child } => child,
        }
    }

    /// 4 processes x 16384 allocations exhaust a 65536 number region
    #[test]
    fn test_parallel_allocation_across_processes() {
        let name = unique_name();
        let region = SharedRegion::open(&name, 8192).unwrap();

        let children: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                spawn_child(move || {
                    let Ok(region) = SharedRegion::open(&name, 8192) else {
                        return false;
                    };
                    let allocator = BitmapAllocator::new(region);
                    (0..16384).all(|_| allocator.allocate().is_ok())
                })
            })
            .collect();

        for child in children {
            let status = waitpid(child, None).unwrap();
            assert!(is_exit_success(status));
        }

        let allocator = BitmapAllocator::new(&region);
        assert!(allocator.allocate().unwrap_err().is_exhausted());
        assert!(region
            .words()
            .unwrap()
            .iter()
            .all(|w| w.load(std::sync::atomic::Ordering::SeqCst) == u32::MAX));

        drop(allocator);
        drop(region);
        SharedRegion::destroy(&name).unwrap();
    }

    /// Numbers freed by one process are handed out again in another
    #[test]
    fn test_free_across_processes() {
        let name = unique_name();
        let region = SharedRegion::open(&name, 16).unwrap();
        let allocator = BitmapAllocator::new(&region);
        for _ in 0..128 {
            allocator.allocate().unwrap();
        }
        assert!(allocator.allocate().unwrap_err().is_exhausted());

        let child = {
            let name = name.clone();
            spawn_child(move || {
                let Ok(region) = SharedRegion::open(&name, 16) else {
                    return false;
                };
                let allocator = BitmapAllocator::new(region);
                (0..128).step_by(2).all(|n| allocator.free(n).is_ok())
            })
        };
        let status = waitpid(child, None).unwrap();
        assert!(is_exit_success(status));

        let mut reused = HashSet::new();
        while let Ok(n) = allocator.allocate() {
            assert_eq!(n % 2, 0);
            reused.insert(n);
        }
        assert_eq!(reused.len(), 64);

        drop(allocator);
        drop(region);
        SharedRegion::destroy(&name).unwrap();
    }

    /// A region written by a child is visible to the parent after it exits
    #[test]
    fn test_region_outlives_creator_process() {
        let name = unique_name();

        let child = {
            let name = name.clone();
            spawn_child(move || {
                let Ok(region) = SharedRegion::open(&name, 256) else {
                    return false;
                };
                region.is_creator() && region.store_word(10, 0xF0F0_F0F0).is_ok()
            })
        };
        let status = waitpid(child, None).unwrap();
        assert!(is_exit_success(status));

        let region = SharedRegion::open(&name, 256).unwrap();
        assert!(!region.is_creator());
        assert_eq!(region.load_word(10).unwrap(), 0xF0F0_F0F0);

        drop(region);
        SharedRegion::destroy(&name).unwrap();
    }
}
