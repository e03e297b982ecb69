//! Cellule de publication mono-écrivain style seqlock
//!
//! Permet au callback audio de publier un petit vecteur de valeurs `i64`
//! sans jamais bloquer, et au thread producteur de le lire sans lock en
//! tolérant une valeur périmée mais jamais déchirée.

use std::hint;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Publication lock-free de `N` valeurs `i64` cohérentes entre elles.
///
/// Protocole classique : l'écrivain incrémente un compteur de version avant
/// et après l'écriture (version impaire = écriture en cours) ; le lecteur
/// relit la version autour de sa lecture et recommence si elle a bougé.
///
/// # Invariant
///
/// Un seul thread écrit. Plusieurs threads peuvent lire.
pub struct SeqLock<const N: usize> {
    version: AtomicU64,
    slots: [AtomicI64; N],
}

impl<const N: usize> SeqLock<N> {
    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            slots: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    /// Publie un jeu de valeurs cohérent. Réservé à l'unique écrivain.
    pub fn write(&self, values: [i64; N]) {
        let v = self.version.fetch_add(1, Ordering::AcqRel);
        debug_assert!(v % 2 == 0, "concurrent writers on SeqLock");
        for (slot, value) in self.slots.iter().zip(values) {
            slot.store(value, Ordering::Release);
        }
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Lit un jeu de valeurs cohérent, en réessayant si une écriture est en
    /// cours. Les écritures étant rares (une par callback audio au plus), la
    /// boucle converge en pratique immédiatement.
    pub fn read(&self) -> [i64; N] {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 % 2 == 1 {
                hint::spin_loop();
                continue;
            }
            let mut out = [0i64; N];
            for (value, slot) in out.iter_mut().zip(&self.slots) {
                *value = slot.load(Ordering::Acquire);
            }
            if self.version.load(Ordering::Acquire) == v1 {
                return out;
            }
            hint::spin_loop();
        }
    }
}

impl<const N: usize> Default for SeqLock<N> {
    fn default() -> Self {
        Self::new()
    }
}
