use std::{
    fmt, hash::Hash, marker::PhantomData, mem, ops::Deref, ptr, ptr::NonNull,
};

use crate::{control::ControlBlock, NullDereference};

/// The two addresses every non-empty strong handle carries.
struct Raw<T>
where
    T: ?Sized,
{
    value: NonNull<T>,
    block: NonNull<ControlBlock>,
}

impl<T> Clone for Raw<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Raw<T> where T: ?Sized {}

impl<T> Raw<T>
where
    T: ?Sized,
{
    fn block(&self) -> &ControlBlock {
        unsafe { self.block.as_ref() }
    }
}

fn thin<T>(value: Option<NonNull<T>>) -> *const ()
where
    T: ?Sized,
{
    value.map_or(ptr::null(), |value| value.as_ptr().cast::<()>() as *const ())
}

/// A thread-safe reference counted pointer, similar to [`Arc`], that may also be empty.
///
/// The value is destroyed when the last `Strong` referring to it is dropped or
/// [`reset`][Strong::reset]. The shared control block lives on until the last [`Weak`] is gone
/// as well.
///
/// [`Arc`]: std::sync::Arc
pub struct Strong<T>
where
    T: ?Sized,
{
    raw: Option<Raw<T>>,
    _owns: PhantomData<T>,
}

unsafe impl<T> Send for Strong<T> where T: ?Sized + Send + Sync {}

unsafe impl<T> Sync for Strong<T> where T: ?Sized + Send + Sync {}

impl<T> Drop for Strong<T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Strong<T>
where
    T: ?Sized,
{
    /// Creates a handle that refers to nothing.
    pub const fn empty() -> Self {
        Strong {
            raw: None,
            _owns: PhantomData,
        }
    }

    /// Takes ownership of a boxed value. Unsized values such as slices and trait objects can be
    /// shared this way.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tether::Strong;
    /// let s: Strong<str> = Strong::from_box(Box::from("abc"));
    /// assert!(&*s == "abc");
    /// ```
    pub fn from_box(value: Box<T>) -> Self {
        Strong {
            raw: Some(Raw {
                value: NonNull::from(Box::leak(value)),
                block: ControlBlock::allocate(),
            }),
            _owns: PhantomData,
        }
    }

    /// Takes ownership of a raw pointer. A null pointer produces an empty handle.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must come from [`Box::into_raw`] and must not be owned by anything else.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        match NonNull::new(ptr) {
            Some(value) => Self::from_box(Box::from_raw(value.as_ptr())),
            None => Self::empty(),
        }
    }

    /// Joins an existing control block whose strong count the caller has already incremented on
    /// this handle's behalf. Only the weak count is incremented here.
    ///
    /// # Safety
    ///
    /// `block` must be alive and the strong increment must not be handed to anyone else.
    unsafe fn attach(value: NonNull<T>, block: NonNull<ControlBlock>) -> Self {
        block.as_ref().increment_weak();

        Strong {
            raw: Some(Raw { value, block }),
            _owns: PhantomData,
        }
    }

    /// Releases this handle's reference, leaving it empty.
    ///
    /// Destroys the value if this was the last strong reference and frees the control block if
    /// this was the last reference of any kind.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tether::Strong;
    /// let mut s = Strong::new(5);
    /// s.reset();
    /// assert!(s.is_empty());
    /// ```
    pub fn reset(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };

        unsafe {
            if raw.block().decrement_strong_and_check_zero() {
                log::trace!("destroying value at {:p}", raw.value);
                drop(Box::from_raw(raw.value.as_ptr()));
            }

            // both counters are released no matter what happened to the value, the strong
            // handle holds a weak reference of its own.
            if raw.block().decrement_weak_and_check_zero() {
                ControlBlock::free(raw.block);
            }
        }
    }

    /// Gets a reference to the value, or `None` if the handle is empty.
    pub fn get(&self) -> Option<&T> {
        self.raw.as_ref().map(|raw| unsafe { raw.value.as_ref() })
    }

    /// Gets a reference to the value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tether::{NullDereference, Strong};
    /// let s = Strong::new(5);
    /// assert!(s.try_get() == Ok(&5));
    ///
    /// let e = Strong::<u32>::empty();
    /// assert!(e.try_get() == Err(NullDereference));
    /// ```
    pub fn try_get(&self) -> Result<&T, NullDereference> {
        self.get().ok_or(NullDereference)
    }

    /// Gets a mutable reference to the value if no other handle, strong or weak, refers to it.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let raw = self.raw.as_mut()?;

        // the weak count includes this handle. at one, nothing else can reach the value and
        // nothing can create a new reference to it.
        if raw.block().weak_count() == 1 {
            Some(unsafe { raw.value.as_mut() })
        } else {
            None
        }
    }

    /// Returns `true` if the handle refers to a value. See [`Weak::is_alive`] for weak handles.
    pub fn is_some(&self) -> bool {
        self.raw.is_some()
    }

    /// Returns `true` if the handle refers to nothing.
    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Gets the number of strong handles to the value, `0` for an empty handle.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::mem::drop;
    /// # use tether::Strong;
    /// let s1 = Strong::new(5);
    /// assert!(s1.ref_count() == 1);
    ///
    /// let s2 = s1.clone();
    /// assert!(s1.ref_count() == 2);
    ///
    /// drop(s2);
    /// assert!(s1.ref_count() == 1);
    /// ```
    pub fn ref_count(&self) -> usize {
        self.raw.as_ref().map_or(0, |raw| raw.block().strong_count())
    }

    /// Gets the number of handles of either kind referring to the control block, `0` for an
    /// empty handle.
    pub fn weak_count(&self) -> usize {
        self.raw.as_ref().map_or(0, |raw| raw.block().weak_count())
    }

    /// Creates a weak handle to the value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tether::Strong;
    /// let s = Strong::new(5);
    /// let w = s.downgrade();
    ///
    /// assert!(s.ref_count() == 1);
    /// assert!(s.weak_count() == 2);
    /// assert!(w.lock() == s);
    /// ```
    pub fn downgrade(&self) -> Weak<T> {
        Weak::new(self)
    }

    fn addr(&self) -> *const () {
        thin(self.raw.map(|raw| raw.value))
    }

    fn same_block(&self, other: &Self) -> bool {
        self.raw.map(|raw| raw.block) == other.raw.map(|raw| raw.block)
    }
}

impl<T> Strong<T> {
    /// Allocates `value` on the heap and returns the first strong handle to it.
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Returns ownership of the value if this is the only strong handle. Returns `Err` if the
    /// handle is empty or other strong handles exist.
    ///
    /// A weak handle racing to [`lock`][Weak::lock] either sees the value gone or makes this
    /// call fail, never both.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tether::Strong;
    /// let s1 = Strong::new(String::from("a"));
    /// let s2 = s1.clone();
    ///
    /// let s1 = s1.into_inner().unwrap_err();
    /// drop(s2);
    /// assert!(s1.into_inner().unwrap() == "a");
    /// ```
    pub fn into_inner(self) -> Result<T, Self> {
        let Some(raw) = self.raw else {
            return Err(self);
        };

        if !raw.block().claim_unique_strong() {
            return Err(self);
        }

        let value = unsafe { *Box::from_raw(raw.value.as_ptr()) };
        unsafe {
            if raw.block().decrement_weak_and_check_zero() {
                ControlBlock::free(raw.block);
            }
        }
        mem::forget(self);

        Ok(value)
    }

    /// Gets a raw pointer to the value, null for an empty handle.
    pub fn as_ptr(&self) -> *const T {
        self.addr().cast()
    }
}

impl<T> Clone for Strong<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            raw.block().increment_strong();
            raw.block().increment_weak();
        }

        Strong {
            raw: self.raw,
            _owns: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.same_block(source) {
            return;
        }

        self.reset();
        *self = source.clone();
    }
}

impl<T> Default for Strong<T>
where
    T: ?Sized,
{
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> From<Box<T>> for Strong<T>
where
    T: ?Sized,
{
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T> Deref for Strong<T>
where
    T: ?Sized,
{
    type Target = T;

    /// # Panics
    ///
    /// Panics with [`NullDereference`] if the handle is empty.
    fn deref(&self) -> &T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Two handles are equal when they share one allocation. Zero-sized values all live at the same
/// dangling address, so the control block is what tells allocations apart.
impl<T> PartialEq for Strong<T>
where
    T: ?Sized,
{
    fn eq(&self, other: &Self) -> bool {
        self.same_block(other)
    }
}

impl<T> Eq for Strong<T> where T: ?Sized {}

impl<T> PartialEq<*const T> for Strong<T>
where
    T: ?Sized,
{
    fn eq(&self, other: &*const T) -> bool {
        self.addr() == other.cast::<()>()
    }
}

impl<T> Hash for Strong<T>
where
    T: ?Sized,
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Hash::hash(&self.raw.map(|raw| raw.block), state)
    }
}

impl<T> fmt::Debug for Strong<T>
where
    T: ?Sized + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("Strong(empty)"),
        }
    }
}

/// A weak handle to a value. It keeps the control block alive but never the value itself.
///
/// A weak handle cannot provide a reference to the value because another thread may drop the last
/// strong handle at any time. Instead it must be promoted with [`lock`][Weak::lock], which
/// succeeds only while the value is still alive.
///
/// [`Weak::is_alive`] answers whether a promotion would succeed right now, the weak counterpart of
/// [`Strong::is_some`].
pub struct Weak<T>
where
    T: ?Sized,
{
    value: Option<NonNull<T>>,
    block: Option<NonNull<ControlBlock>>,
}

unsafe impl<T> Send for Weak<T> where T: ?Sized + Send + Sync {}

unsafe impl<T> Sync for Weak<T> where T: ?Sized + Send + Sync {}

impl<T> Drop for Weak<T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Weak<T>
where
    T: ?Sized,
{
    /// Creates a weak handle that refers to nothing. It never promotes.
    pub const fn empty() -> Self {
        Weak {
            value: None,
            block: None,
        }
    }

    /// See [`Strong::downgrade`].
    pub fn new(strong: &Strong<T>) -> Self {
        match strong.raw {
            Some(raw) => {
                raw.block().increment_weak();
                Weak {
                    value: Some(raw.value),
                    block: Some(raw.block),
                }
            }
            None => Self::empty(),
        }
    }

    /// Releases this handle's reference and makes it refer to the value of `strong` instead.
    pub fn assign(&mut self, strong: &Strong<T>) {
        self.reset();
        *self = Weak::new(strong);
    }

    /// Releases this handle's reference, leaving it empty. Frees the control block if this was
    /// the last reference of any kind. The value is never touched.
    pub fn reset(&mut self) {
        self.value = None;
        if let Some(block) = self.block.take() {
            unsafe {
                if block.as_ref().decrement_weak_and_check_zero() {
                    ControlBlock::free(block);
                }
            }
        }
    }

    /// Attempts to promote this handle. Returns an empty [`Strong`] if the value has already been
    /// destroyed or this handle is empty.
    ///
    /// Promotions of handles to the same value are serialized by the control block's lock. A
    /// strong handle dropped concurrently is either released before the promotion, which then
    /// fails, or after it, in which case the value survives.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::mem::drop;
    /// # use tether::Strong;
    /// let s = Strong::new(5);
    /// let w = s.downgrade();
    ///
    /// assert!(*w.lock() == 5);
    ///
    /// drop(s);
    /// assert!(w.lock().is_empty());
    /// ```
    pub fn lock(&self) -> Strong<T> {
        let (Some(value), Some(block)) = (self.value, self.block) else {
            return Strong::empty();
        };

        {
            let shared = unsafe { block.as_ref() };
            let _guard = shared.acquire_lock();

            // a strong count of zero is final. our increment can be the only one that lifts it,
            // because every other increment comes from a live strong handle or from a promotion
            // waiting on the lock we hold.
            if shared.fetch_add_strong(1) == 0 {
                shared.undo_failed_promotion();
                log::trace!("promotion failed, value at {:p} is gone", value);
                return Strong::empty();
            }
        }

        unsafe { Strong::attach(value, block) }
    }

    /// Like [`lock`][Weak::lock] but returns `None` instead of an empty handle.
    pub fn upgrade(&self) -> Option<Strong<T>> {
        let strong = self.lock();
        if strong.is_some() {
            Some(strong)
        } else {
            None
        }
    }

    /// Returns `true` if a promotion attempted right now succeeds. The promoted handle is
    /// dropped again immediately, so the answer may be stale by the time it is used.
    pub fn is_alive(&self) -> bool {
        self.lock().is_some()
    }

    /// Returns `true` if the handle refers to no control block.
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    /// Gets the number of strong handles to the value. Returns `0` once the value is destroyed
    /// or when this handle is empty.
    pub fn strong_count(&self) -> usize {
        self.block
            .map_or(0, |block| unsafe { block.as_ref() }.strong_count())
    }

    /// Gets the number of handles of either kind referring to the control block.
    pub fn weak_count(&self) -> usize {
        self.block
            .map_or(0, |block| unsafe { block.as_ref() }.weak_count())
    }
}

impl<T> Weak<T> {
    /// Gets the address of the value this handle was created for. The value may already be
    /// destroyed, so the pointer must not be dereferenced without a successful
    /// [`lock`][Weak::lock].
    pub fn as_ptr(&self) -> *const T {
        thin(self.value).cast()
    }
}

impl<T> Clone for Weak<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            unsafe { block.as_ref() }.increment_weak();
        }

        Weak {
            value: self.value,
            block: self.block,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.block == source.block {
            return;
        }

        self.reset();
        *self = source.clone();
    }
}

impl<T> Default for Weak<T>
where
    T: ?Sized,
{
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> From<&Strong<T>> for Weak<T>
where
    T: ?Sized,
{
    fn from(value: &Strong<T>) -> Self {
        Self::new(value)
    }
}

impl<T> PartialEq for Weak<T>
where
    T: ?Sized,
{
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl<T> Eq for Weak<T> where T: ?Sized {}

impl<T> Hash for Weak<T>
where
    T: ?Sized,
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Hash::hash(&self.block.map_or(ptr::null_mut(), |block| block.as_ptr()), state)
    }
}

impl<T> fmt::Debug for Weak<T>
where
    T: ?Sized + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("Weak");
        let strong = self.lock();
        if let Some(value) = strong.get() {
            f.field(&value);
        }
        f.finish()
    }
}
