/*!
Utilitaires de test partagés

- Initialisation du logging (une seule fois par binaire de test)
- Attente active bornée sur une condition
*/

use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Active les logs `tracing` dans les tests ; `RUST_LOG` reste prioritaire.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Réévalue `cond` toutes les 10 ms jusqu'à ce qu'elle soit vraie ou que
/// `limit` soit écoulé. Renvoie l'état final de la condition.
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let res = tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    res.is_ok()
}
