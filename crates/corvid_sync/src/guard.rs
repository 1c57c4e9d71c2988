use crate::relax::Relax;
use crate::spin::Spin;
use core::ops::{Deref, DerefMut};

pub struct SpinGuard<'a, T, R>
where
    T: ?Sized,
    R: Relax,
{
    lock: &'a Spin<T, R>,
    value: &'a mut T,
}

impl<'a, T, R> SpinGuard<'a, T, R>
where
    T: ?Sized,
    R: Relax,
{
    pub(crate) fn new(lock: &'a Spin<T, R>, value: &'a mut T) -> Self {
        Self { lock, value }
    }
}

impl<T, R> Deref for SpinGuard<'_, T, R>
where
    T: ?Sized,
    R: Relax,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<T, R> DerefMut for SpinGuard<'_, T, R>
where
    T: ?Sized,
    R: Relax,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<T, R> Drop for SpinGuard<'_, T, R>
where
    T: ?Sized,
    R: Relax,
{
    fn drop(&mut self) {
        unsafe {
            // SAFETY: The guard is the only access path to the value and
            // it is going away.
            self.lock.raw_unlock();
        }
    }
}
