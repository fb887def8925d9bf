//! État mutable partagé entre les tâches de fond du kernel.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copie de la valeur courante ; le verrou est relâché au retour
pub fn read_state<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}

/// Remplace la valeur, renvoie l'ancienne
pub fn replace_state<T>(state: &Shared<T>, value: T) -> T {
    std::mem::replace(&mut *state.lock(), value)
}
