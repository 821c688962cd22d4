/*!
# RouterWatch DevKit - Stubs et Utilitaires de test

Bibliothèque facilitant le test du moniteur RouterWatch sans réseau :
- Broker MQTT simulé (client + boucle d'événements)
- Faux service check-host.net scriptable
- Helpers de logging et d'attente
*/

pub mod mqtt_stub;
pub mod oracle_stub;
pub mod test_utils;

pub use mqtt_stub::{mock_broker, MockEvent, MockEventLoop, MockMqttClient};
pub use oracle_stub::{FakeOracle, OracleScript, Reply};
pub use test_utils::{init_tracing, wait_until};
