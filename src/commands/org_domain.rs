//! Organization domains.
//!
//! A verified domain is claimed across the whole instance. Verification
//! either proves control through a generated token published over HTTP or
//! DNS, or is granted directly by an instance administrator.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::CommandError;
use crate::event::AggregateType;
use crate::payload::org::{DomainValidationType, OrgEvent};
use crate::preparation::{CreateCommands, Env, Prepared, Validation};
use crate::secret::{SecretGeneratorType, VerifyOutcome};
use crate::services::permissions;
use crate::write_model::{OrgDomainWriteModel, WriteModel};

use super::org::load_org;
use super::{aggregate, require};

fn normalize_domain(domain: &str) -> Result<String, CommandError> {
    let domain = domain.trim().to_lowercase();
    require("domain", &domain)?;
    if !domain.contains('.') || domain.chars().any(char::is_whitespace) {
        return Err(CommandError::invalid("domain is malformed"));
    }
    Ok(domain)
}

async fn load_domain(
    env: &Env<'_>,
    org_id: &str,
    domain: &str,
) -> Result<OrgDomainWriteModel, CommandError> {
    let model = env
        .filter
        .load(OrgDomainWriteModel::new(env.filter.instance_id(), org_id, domain))
        .await?;
    if !model.exists {
        return Err(CommandError::not_found("domain not found"));
    }
    Ok(model)
}

macro_rules! domain_command {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub org_id: String,
            pub domain: String,
        }

        impl Validation for $name {
            type Output = ();
            type Prepared = Self;

            fn validate(mut self) -> Result<Self, CommandError> {
                require("org_id", &self.org_id)?;
                self.domain = normalize_domain(&self.domain)?;
                Ok(self)
            }
        }
    };
}

domain_command!(
    /// Add a domain to an organization.
    ///
    /// When domain validation is disabled the domain is verified, and thereby
    /// claimed, in the same push.
    AddOrgDomain
);
domain_command!(
    /// Mark a domain verified without a validation token, claiming it across
    /// the instance. Reserved for instance administrators.
    VerifyOrgDomain
);
domain_command!(SetPrimaryOrgDomain);
domain_command!(
    /// Remove a domain. The primary domain cannot be removed.
    RemoveOrgDomain
);

#[async_trait]
impl CreateCommands for AddOrgDomain {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let org = load_org(env, &self.org_id).await?;
        env.check_permission(permissions::ORG_WRITE, org.org_id(), org.org_id())?;
        let domain = env
            .filter
            .load(OrgDomainWriteModel::new(
                env.filter.instance_id(),
                org.org_id(),
                self.domain.as_str(),
            ))
            .await?;
        if domain.exists {
            return Err(CommandError::already_exists("domain already added"));
        }
        let agg = aggregate(env, AggregateType::Org, org.org_id(), org.org_id())?;
        let guard = domain.guard();
        let mut commands = vec![
            Command::new(
                agg.clone(),
                OrgEvent::DomainAdded {
                    domain: self.domain.clone(),
                },
            )
            .guarded(guard.clone()),
        ];
        if !env.services.config.validate_org_domains {
            commands.push(
                Command::new(
                    agg,
                    OrgEvent::DomainVerified {
                        domain: self.domain.clone(),
                    },
                )
                .guarded(guard),
            );
        }
        Ok(Prepared::new(commands, ()))
    }
}

#[async_trait]
impl CreateCommands for VerifyOrgDomain {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let domain = load_domain(env, &self.org_id, &self.domain).await?;
        let instance_id = env.filter.instance_id();
        env.check_permission(permissions::IAM_WRITE, instance_id, instance_id)?;
        if domain.verified {
            return Err(CommandError::precondition("domain already verified"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::DomainVerified {
                domain: self.domain.clone(),
            },
        )
        .guarded(domain.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

/// Where the caller must publish a domain validation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainValidation {
    pub token: String,
    pub location: String,
}

/// Issue a validation token for an unverified domain, replacing any
/// earlier one.
#[derive(Debug, Clone)]
pub struct GenerateOrgDomainValidation {
    pub org_id: String,
    pub domain: String,
    pub validation_type: DomainValidationType,
}

impl Validation for GenerateOrgDomainValidation {
    type Output = DomainValidation;
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.domain = normalize_domain(&self.domain)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for GenerateOrgDomainValidation {
    type Output = DomainValidation;

    async fn create_commands(
        &self,
        env: &Env<'_>,
    ) -> Result<Prepared<DomainValidation>, CommandError> {
        let domain = load_domain(env, &self.org_id, &self.domain).await?;
        env.check_permission(permissions::ORG_WRITE, &self.org_id, &self.org_id)?;
        if domain.verified {
            return Err(CommandError::precondition("domain already verified"));
        }
        let code = env.issue_code(SecretGeneratorType::VerifyDomain).await?;
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::DomainVerificationAdded {
                domain: self.domain.clone(),
                validation_type: self.validation_type,
                code: code.crypted,
                expiry: code.expiry,
            },
        )
        .guarded(domain.guard());
        let output = DomainValidation {
            location: self.validation_type.token_location(&self.domain, &code.plain),
            token: code.plain,
        };
        Ok(Prepared::new(vec![command], output))
    }
}

/// Verify a domain with the token the caller found published at the
/// location [`GenerateOrgDomainValidation`] returned.
///
/// Fetching the token over HTTP or DNS happens outside this crate. A wrong
/// token is recorded as a failed validation; unlike user codes it never
/// locks anything.
#[derive(Debug, Clone, Default)]
pub struct ValidateOrgDomain {
    pub org_id: String,
    pub domain: String,
    pub token: String,
}

impl Validation for ValidateOrgDomain {
    type Output = ();
    type Prepared = Self;

    fn validate(mut self) -> Result<Self, CommandError> {
        require("org_id", &self.org_id)?;
        self.domain = normalize_domain(&self.domain)?;
        self.token = self.token.trim().to_string();
        require("token", &self.token)?;
        Ok(self)
    }
}

#[async_trait]
impl CreateCommands for ValidateOrgDomain {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let domain = load_domain(env, &self.org_id, &self.domain).await?;
        env.check_permission(permissions::ORG_WRITE, &self.org_id, &self.org_id)?;
        if domain.verified {
            return Err(CommandError::precondition("domain already verified"));
        }
        let agg = aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?;
        match env.verify_code(domain.validation.as_ref(), 0, &self.token)? {
            VerifyOutcome::Valid => {
                let event = OrgEvent::DomainVerified {
                    domain: self.domain.clone(),
                };
                let command = Command::new(agg, event).guarded(domain.guard());
                Ok(Prepared::new(vec![command], ()))
            }
            VerifyOutcome::InvalidCode => {
                tracing::warn!(
                    org_id = %self.org_id,
                    domain = %self.domain,
                    "domain validation failed"
                );
                let event = OrgEvent::DomainVerificationFailed {
                    domain: self.domain.clone(),
                };
                let command = Command::new(agg, event).guarded(domain.guard());
                Ok(Prepared::rejected(
                    vec![command],
                    (),
                    CommandError::invalid("domain validation failed"),
                ))
            }
            VerifyOutcome::Expired => Err(CommandError::precondition("validation token expired")),
            VerifyOutcome::Locked | VerifyOutcome::NoCodePending => {
                Err(CommandError::precondition("no validation pending"))
            }
        }
    }
}

#[async_trait]
impl CreateCommands for SetPrimaryOrgDomain {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let domain = load_domain(env, &self.org_id, &self.domain).await?;
        env.check_permission(permissions::ORG_WRITE, &self.org_id, &self.org_id)?;
        if !domain.verified {
            return Err(CommandError::precondition("domain not verified"));
        }
        if domain.primary {
            return Err(CommandError::precondition("domain already primary"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::DomainPrimarySet {
                domain: self.domain.clone(),
            },
        )
        .guarded(domain.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}

#[async_trait]
impl CreateCommands for RemoveOrgDomain {
    type Output = ();

    async fn create_commands(&self, env: &Env<'_>) -> Result<Prepared<()>, CommandError> {
        let domain = load_domain(env, &self.org_id, &self.domain).await?;
        env.check_permission(permissions::ORG_WRITE, &self.org_id, &self.org_id)?;
        if domain.primary {
            return Err(CommandError::precondition("primary domain cannot be removed"));
        }
        let command = Command::new(
            aggregate(env, AggregateType::Org, &self.org_id, &self.org_id)?,
            OrgEvent::DomainRemoved {
                domain: self.domain.clone(),
                was_verified: domain.verified,
            },
        )
        .guarded(domain.guard());
        Ok(Prepared::new(vec![command], ()))
    }
}
