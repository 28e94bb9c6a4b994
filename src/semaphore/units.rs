//! Scoped ownership of granted semaphore units.
use super::Semaphore;
use crate::error::{DefaultErrorFactory, ErrorFactory, NotEnoughUnits};
use crate::util::fmt;
use alloc::rc::Rc;
use core::mem;
use core::ptr;

/// A [RAII guard] holding a quantity of units granted by a [`Semaphore`].
///
/// Whatever the guard still holds when it is dropped is
/// [`signal`](Semaphore::signal)ed back to the semaphore, so taking units
/// through a `Units` guard guarantees their return on every exit path,
/// including early returns, panics, and cancelled futures. Units can also be
/// given
/// back early ([`return_units`], [`return_all`]), carved off into a second
/// guard ([`split`]), merged from another guard ([`adopt`]), or removed from
/// circulation entirely ([`release`]).
///
/// A guard holding 0 units is *empty* and does nothing when dropped.
///
/// Returned by [`Semaphore::get_units`], [`Semaphore::try_get_units`], and
/// [`Semaphore::consume_units`]. For a guard that does not borrow the
/// semaphore, see [`OwnedUnits`].
///
/// [RAII guard]: https://rust-unofficial.github.io/patterns/patterns/behavioural/RAII.html
/// [`return_units`]: Self::return_units
/// [`return_all`]: Self::return_all
/// [`split`]: Self::split
/// [`adopt`]: Self::adopt
/// [`release`]: Self::release
#[must_use = "dropping `Units` immediately returns the held units to the `Semaphore`"]
pub struct Units<'sem, F: ErrorFactory = DefaultErrorFactory> {
    semaphore: &'sem Semaphore<F>,
    count: usize,
}

/// An owned [`Units`]: holds its units against an [`Rc`]'d [`Semaphore`]
/// rather than borrowing it, and is therefore valid for the `'static`
/// lifetime.
///
/// Returned by [`Semaphore::get_units_owned`] and
/// [`Semaphore::try_get_units_owned`].
#[must_use = "dropping `OwnedUnits` immediately returns the held units to the `Semaphore`"]
pub struct OwnedUnits<F: ErrorFactory = DefaultErrorFactory> {
    semaphore: Rc<Semaphore<F>>,
    count: usize,
}

// === impl Units ===

impl<'sem, F: ErrorFactory> Units<'sem, F> {
    /// Takes ownership of `count` freshly granted units.
    pub(super) fn grant(semaphore: &'sem Semaphore<F>, count: usize) -> Self {
        semaphore.track_granted(count);
        Self { semaphore, count }
    }

    /// Returns the number of units held by this guard.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if this guard holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Borrows the semaphore these units were granted by.
    #[must_use]
    pub fn semaphore(&self) -> &'sem Semaphore<F> {
        self.semaphore
    }

    /// Gives `units` of this guard's units back to the semaphore, signaling
    /// it by that amount.
    ///
    /// Returns the number of units remaining in the guard, or
    /// [`NotEnoughUnits`] if `units` exceeds the held count (in which case
    /// nothing changes).
    pub fn return_units(&mut self, units: usize) -> Result<usize, NotEnoughUnits> {
        if units > self.count {
            return Err(NotEnoughUnits::new(units, self.count));
        }
        self.count -= units;
        self.semaphore.return_granted(units);
        Ok(self.count)
    }

    /// Gives all of this guard's units back to the semaphore, signaling it
    /// by the held count. The guard is left empty.
    pub fn return_all(&mut self) {
        let units = mem::replace(&mut self.count, 0);
        if units > 0 {
            self.semaphore.return_granted(units);
        }
    }

    /// Forgets the held units *without* signaling the semaphore, leaving the
    /// guard empty.
    ///
    /// This permanently lowers the semaphore's unit count by the amount
    /// held. Returns the number of units that were held.
    pub fn release(&mut self) -> usize {
        let units = mem::replace(&mut self.count, 0);
        self.semaphore.forget_granted(units);
        units
    }

    /// Carves `units` off into a new guard against the same semaphore; this
    /// guard keeps the remainder.
    ///
    /// Fails with [`NotEnoughUnits`] if `units` exceeds the held count (in
    /// which case nothing changes).
    pub fn split(&mut self, units: usize) -> Result<Units<'sem, F>, NotEnoughUnits> {
        if units > self.count {
            return Err(NotEnoughUnits::new(units, self.count));
        }
        self.count -= units;
        // ownership of the units moves between guards; the semaphore's
        // outstanding total is unchanged.
        Ok(Units {
            semaphore: self.semaphore,
            count: units,
        })
    }

    /// The inverse of [`split`](Self::split): merges `other`'s units into
    /// this guard.
    ///
    /// # Panics
    ///
    /// If the two guards were granted by different semaphores.
    pub fn adopt(&mut self, mut other: Units<'sem, F>) {
        assert!(
            ptr::eq(self.semaphore, other.semaphore),
            "cannot adopt units granted by a different semaphore",
        );
        self.count += mem::replace(&mut other.count, 0);
    }
}

impl<F: ErrorFactory> Drop for Units<'_, F> {
    fn drop(&mut self) {
        if self.count > 0 {
            trace!(count = self.count, "Units::drop");
            self.semaphore.return_granted(self.count);
        }
    }
}

impl<F: ErrorFactory> fmt::Debug for Units<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Units").field("count", &self.count).finish()
    }
}

// === impl OwnedUnits ===

impl<F: ErrorFactory> OwnedUnits<F> {
    /// Takes ownership of `count` freshly granted units.
    pub(super) fn grant(semaphore: Rc<Semaphore<F>>, count: usize) -> Self {
        semaphore.track_granted(count);
        Self { semaphore, count }
    }

    /// Returns the number of units held by this guard.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if this guard holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Borrows the semaphore these units were granted by.
    #[must_use]
    pub fn semaphore(&self) -> &Semaphore<F> {
        &self.semaphore
    }

    /// Gives `units` of this guard's units back to the semaphore, signaling
    /// it by that amount.
    ///
    /// Returns the number of units remaining in the guard, or
    /// [`NotEnoughUnits`] if `units` exceeds the held count (in which case
    /// nothing changes).
    pub fn return_units(&mut self, units: usize) -> Result<usize, NotEnoughUnits> {
        if units > self.count {
            return Err(NotEnoughUnits::new(units, self.count));
        }
        self.count -= units;
        self.semaphore.return_granted(units);
        Ok(self.count)
    }

    /// Gives all of this guard's units back to the semaphore, signaling it
    /// by the held count. The guard is left empty.
    pub fn return_all(&mut self) {
        let units = mem::replace(&mut self.count, 0);
        if units > 0 {
            self.semaphore.return_granted(units);
        }
    }

    /// Forgets the held units *without* signaling the semaphore, leaving the
    /// guard empty.
    ///
    /// This permanently lowers the semaphore's unit count by the amount
    /// held. Returns the number of units that were held.
    pub fn release(&mut self) -> usize {
        let units = mem::replace(&mut self.count, 0);
        self.semaphore.forget_granted(units);
        units
    }

    /// Carves `units` off into a new guard against the same semaphore; this
    /// guard keeps the remainder.
    ///
    /// Fails with [`NotEnoughUnits`] if `units` exceeds the held count (in
    /// which case nothing changes).
    pub fn split(&mut self, units: usize) -> Result<OwnedUnits<F>, NotEnoughUnits> {
        if units > self.count {
            return Err(NotEnoughUnits::new(units, self.count));
        }
        self.count -= units;
        Ok(OwnedUnits {
            semaphore: self.semaphore.clone(),
            count: units,
        })
    }

    /// The inverse of [`split`](Self::split): merges `other`'s units into
    /// this guard.
    ///
    /// # Panics
    ///
    /// If the two guards were granted by different semaphores.
    pub fn adopt(&mut self, mut other: OwnedUnits<F>) {
        assert!(
            Rc::ptr_eq(&self.semaphore, &other.semaphore),
            "cannot adopt units granted by a different semaphore",
        );
        self.count += mem::replace(&mut other.count, 0);
    }
}

impl<F: ErrorFactory> Drop for OwnedUnits<F> {
    fn drop(&mut self) {
        if self.count > 0 {
            trace!(count = self.count, "OwnedUnits::drop");
            self.semaphore.return_granted(self.count);
        }
    }
}

impl<F: ErrorFactory> fmt::Debug for OwnedUnits<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedUnits")
            .field("count", &self.count)
            .finish()
    }
}
