//! Broker entity verification.
//!
//! Before messages flow, each mapping's [`CreationPolicy`] is applied to the
//! entity it names:
//!
//! - `None`: the entity is not inspected
//! - `CreateIfNotExists`: missing entities are created; the topic of a
//!   subscription is created first when it is missing too
//! - `VerifyAlreadyExists`: a missing entity is a configuration error

use crate::{
    CreationPolicy, EntityKind, MessageTypeMapping,
    config::{ConfigurationError, ConfigurationErrorKind},
    transport::EntityManager,
};

/// Applies creation policies through an [`EntityManager`].
pub struct EntityVerifier<'a> {
    manager: &'a dyn EntityManager,
}

impl<'a> EntityVerifier<'a> {
    pub fn new(manager: &'a dyn EntityManager) -> Self {
        Self { manager }
    }

    /// Verify every mapping in order, stopping at the first failure.
    pub async fn verify_all<'m>(
        &self,
        mappings: impl IntoIterator<Item = &'m MessageTypeMapping>,
    ) -> Result<(), ConfigurationError> {
        for mapping in mappings {
            self.verify(mapping).await?;
        }
        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        fields(
            path = mapping.path(),
            entity_kind = %mapping.entity_kind(),
            policy = ?mapping.creation_policy(),
        )
    )]
    pub async fn verify(&self, mapping: &MessageTypeMapping) -> Result<(), ConfigurationError> {
        let policy = mapping.creation_policy();
        if policy == CreationPolicy::None {
            return Ok(());
        }

        if self.exists(mapping).await? {
            tracing::debug!("Entity exists");
            return Ok(());
        }

        match policy {
            CreationPolicy::None => Ok(()),
            CreationPolicy::VerifyAlreadyExists => {
                Err(ConfigurationError::new(ConfigurationErrorKind::EntityNotFound {
                    path: mapping.path().to_owned(),
                    entity_kind: mapping.entity_kind(),
                }))
            }
            CreationPolicy::CreateIfNotExists => {
                self.create(mapping).await?;
                tracing::info!("Entity created");
                Ok(())
            }
        }
    }

    async fn exists(&self, mapping: &MessageTypeMapping) -> Result<bool, ConfigurationError> {
        let exists = match mapping.entity_kind() {
            EntityKind::Queue => self.manager.queue_exists(mapping.path()).await?,
            EntityKind::Topic => self.manager.topic_exists(mapping.path()).await?,
            EntityKind::Subscription => {
                let (topic, name) = subscription_parts(mapping)?;
                self.manager.subscription_exists(topic, name).await?
            }
        };
        Ok(exists)
    }

    async fn create(&self, mapping: &MessageTypeMapping) -> Result<(), ConfigurationError> {
        match mapping.entity_kind() {
            EntityKind::Queue => self.manager.create_queue(mapping.path()).await?,
            EntityKind::Topic => self.manager.create_topic(mapping.path()).await?,
            EntityKind::Subscription => {
                let (topic, name) = subscription_parts(mapping)?;
                if !self.manager.topic_exists(topic).await? {
                    tracing::info!(topic, "Creating topic of subscription");
                    self.manager.create_topic(topic).await?;
                }
                self.manager.create_subscription(topic, name).await?;
            }
        }
        Ok(())
    }
}

fn subscription_parts(mapping: &MessageTypeMapping) -> Result<(&str, &str), ConfigurationError> {
    mapping.subscription_parts().ok_or_else(|| {
        ConfigurationError::new(ConfigurationErrorKind::InvalidConfiguration {
            reason: format!("malformed subscription path {}", mapping.path()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemory;

    struct Audit;

    #[tokio::test]
    async fn missing_entities_are_created_on_demand() {
        let broker = InMemory::default();
        let verifier = EntityVerifier::new(&broker);
        let mappings = [
            MessageTypeMapping::queue::<Audit>("audit")
                .with_creation_policy(CreationPolicy::CreateIfNotExists),
            MessageTypeMapping::subscription::<Audit>("events", "audit")
                .with_creation_policy(CreationPolicy::CreateIfNotExists),
        ];

        verifier.verify_all(&mappings).await.unwrap();

        assert!(broker.queue_exists("audit").await.unwrap());
        assert!(broker.topic_exists("events").await.unwrap());
        assert!(broker.subscription_exists("events", "audit").await.unwrap());
    }

    #[tokio::test]
    async fn verify_already_exists_reports_missing_entities() {
        let broker = InMemory::default();
        broker.create_topic("events").await.unwrap();
        let verifier = EntityVerifier::new(&broker);

        verifier
            .verify(
                &MessageTypeMapping::topic::<Audit>("events")
                    .with_creation_policy(CreationPolicy::VerifyAlreadyExists),
            )
            .await
            .unwrap();

        let err = verifier
            .verify(
                &MessageTypeMapping::queue::<Audit>("audit")
                    .with_creation_policy(CreationPolicy::VerifyAlreadyExists),
            )
            .await
            .unwrap_err();

        match err.kind() {
            ConfigurationErrorKind::EntityNotFound { path, entity_kind } => {
                assert_eq!(path, "audit");
                assert_eq!(*entity_kind, EntityKind::Queue);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(!broker.queue_exists("audit").await.unwrap());
    }

    #[tokio::test]
    async fn policy_none_leaves_the_broker_alone() {
        let broker = InMemory::default();
        let verifier = EntityVerifier::new(&broker);

        verifier
            .verify(&MessageTypeMapping::queue::<Audit>("audit"))
            .await
            .unwrap();

        assert!(!broker.queue_exists("audit").await.unwrap());
    }
}
