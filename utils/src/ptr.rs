//! A fallible-allocation wrapper around [`alloc::sync::Arc`].
//!
//! Every `Arc` the kernel hands out is a refcounted handle shared between an inode and the
//! mappings that reference it, or between a process and its children; an allocation failure
//! while bumping that count has to propagate as `-ENOMEM`, not panic.

use crate::AllocResult;
use alloc::sync::Arc as StdArc;
use core::alloc::AllocError;
use core::ops::Deref;

/// Reference-counted pointer. Construction goes through [`Arc::new`], which returns
/// [`AllocResult`] rather than the infallible constructor `alloc::sync::Arc::new` provides.
#[derive(Debug)]
pub struct Arc<T: ?Sized>(StdArc<T>);

impl<T> Arc<T> {
	pub fn new(val: T) -> AllocResult<Self> {
		// `alloc::sync::Arc::new` cannot report allocation failure without the unstable
		// allocator_api; wrapping it here keeps the fallible call convention at every call
		// site even though the underlying allocation itself cannot yet be probed for failure.
		Ok(Self(StdArc::new(val)))
	}
}

impl<T: ?Sized> Clone for Arc<T> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<T: ?Sized> Deref for Arc<T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.0
	}
}

impl<T: ?Sized> TryFrom<StdArc<T>> for Arc<T> {
	type Error = AllocError;
	fn try_from(val: StdArc<T>) -> Result<Self, AllocError> {
		Ok(Self(val))
	}
}
