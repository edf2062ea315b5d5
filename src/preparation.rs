//! Two-stage command preparation and the orchestrator that pushes its
//! result.
//!
//! Stage 1 ([`Validation`]) checks the caller's input without I/O and
//! yields a stage-2 value. Stage 2 ([`CreateCommands`]) reads current state
//! through the [`Filter`] in its [`Env`], decides, and returns the
//! [`Command`]s to push. Stage 2 takes `&self` so the orchestrator can
//! re-run it after a sequence conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::command::{Command, CommandContext};
use crate::error::{CommandError, GatewayError};
use crate::event::Event;
use crate::eventstore::{EventStore, SearchQuery};
use crate::secret::{self, EncryptedCode, PendingCode, SecretGeneratorType, VerifyOutcome};
use crate::services::Services;
use crate::write_model::WriteModel;

/// Read access to the event log, scoped to one request.
#[derive(Clone, Copy)]
pub struct Filter<'a> {
    store: &'a dyn EventStore,
    ctx: &'a CommandContext,
}

impl<'a> Filter<'a> {
    pub fn new(store: &'a dyn EventStore, ctx: &'a CommandContext) -> Self {
        Self { store, ctx }
    }

    /// Instance every read of this filter is scoped to.
    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    /// Events matching `query`, in commit order.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Internal`] if the gateway fails or the request
    /// deadline passed.
    pub async fn events(&self, query: &SearchQuery) -> Result<Vec<Event>, CommandError> {
        self.store.filter(self.ctx, query).await.map_err(|e| {
            tracing::error!(error = %e, "filter failed");
            CommandError::from(e)
        })
    }

    /// Run `model`'s query, then buffer and reduce the result.
    ///
    /// # Errors
    ///
    /// Propagates filter and reduce failures.
    pub async fn load<W: WriteModel>(&self, mut model: W) -> Result<W, CommandError> {
        let events = self.events(&model.query()).await?;
        model.append_events(&events);
        model.reduce()?;
        Ok(model)
    }
}

/// Everything stage 2 may use.
pub struct Env<'a> {
    pub filter: Filter<'a>,
    pub ctx: &'a CommandContext,
    pub services: &'a Services,
}

impl Env<'_> {
    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn next_id(&self) -> Result<String, CommandError> {
        self.services.id_generator.next_id()
    }

    /// Ask the permission collaborator.
    pub fn check_permission(
        &self,
        permission: &str,
        resource_owner: &str,
        target_id: &str,
    ) -> Result<(), CommandError> {
        self.services
            .permissions
            .check_permission(self.ctx, permission, resource_owner, target_id)
    }

    /// Like [`check_permission`](Env::check_permission), but a user acting
    /// on itself is always allowed.
    pub fn check_user_permission(
        &self,
        permission: &str,
        resource_owner: &str,
        user_id: &str,
    ) -> Result<(), CommandError> {
        if self.ctx.is_self(user_id) {
            return Ok(());
        }
        self.check_permission(permission, resource_owner, user_id)
    }

    /// Issue a code with the instance's generator configuration.
    pub async fn issue_code(
        &self,
        generator_type: SecretGeneratorType,
    ) -> Result<EncryptedCode, CommandError> {
        let fallback = self.services.config.generator_default(generator_type);
        secret::issue(
            &self.filter,
            generator_type,
            &fallback,
            self.services.code_encryption.as_ref(),
        )
        .await
    }

    /// Check `candidate` against `pending` with the configured failure
    /// ceiling and the current time.
    pub fn verify_code(
        &self,
        pending: Option<&PendingCode>,
        failed_attempts: u32,
        candidate: &str,
    ) -> Result<VerifyOutcome, CommandError> {
        secret::verify(
            pending,
            failed_attempts,
            self.services.config.max_code_attempts,
            candidate,
            self.now(),
            self.services.code_encryption.as_ref(),
        )
    }

    /// Whether one more failed check reaches the failure ceiling.
    pub fn reaches_ceiling(&self, failed_attempts: u32) -> bool {
        let ceiling = self.services.config.max_code_attempts;
        ceiling > 0 && failed_attempts + 1 >= ceiling
    }
}

/// Stage 2 result.
#[derive(Debug)]
pub struct Prepared<T> {
    /// Commands to push atomically, in order.
    pub commands: Vec<Command>,
    /// Value handed back to the caller on success.
    pub output: T,
    /// Error surfaced to the caller after `commands` are pushed.
    pub rejection: Option<CommandError>,
}

impl<T> Prepared<T> {
    pub fn new(commands: Vec<Command>, output: T) -> Self {
        Self {
            commands,
            output,
            rejection: None,
        }
    }

    /// Push `commands`, then fail with `rejection`.
    pub fn rejected(commands: Vec<Command>, output: T, rejection: CommandError) -> Self {
        Self {
            commands,
            output,
            rejection: Some(rejection),
        }
    }
}

/// Stage 2: read state and decide which commands to push.
#[async_trait]
pub trait CreateCommands: Send + Sync {
    type Output: Send;

    async fn create_commands(&self, env: &Env<'_>)
    -> Result<Prepared<Self::Output>, CommandError>;
}

/// Stage 1: check caller input without I/O.
pub trait Validation: Send {
    type Output: Send;
    type Prepared: CreateCommands<Output = Self::Output>;

    /// # Errors
    ///
    /// Only ever [`CommandError::InvalidArgument`].
    fn validate(self) -> Result<Self::Prepared, CommandError>;
}

/// Identity of the last event a command wrote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectDetails {
    pub sequence: u64,
    /// `None` if the command pushed nothing.
    pub event_date: Option<DateTime<Utc>>,
    pub resource_owner: String,
}

impl ObjectDetails {
    fn from_events(events: &[Event]) -> Self {
        events.last().map_or_else(Self::default, |e| Self {
            sequence: e.sequence,
            event_date: Some(e.created_at),
            resource_owner: e.aggregate.resource_owner.clone(),
        })
    }
}

/// Result of a successful [`execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub details: ObjectDetails,
    pub output: T,
}

/// Run both stages without pushing.
///
/// # Errors
///
/// Any error of either stage.
pub async fn prepare_commands<V: Validation>(
    store: &dyn EventStore,
    services: &Services,
    ctx: &CommandContext,
    validation: V,
) -> Result<Prepared<V::Output>, CommandError> {
    let prepared = validation.validate()?;
    let env = Env {
        filter: Filter::new(store, ctx),
        ctx,
        services,
    };
    prepared.create_commands(&env).await
}

/// Run both stages and push the result.
///
/// A sequence conflict during push re-runs stage 2 against fresh state, up
/// to `max_conflict_retries` times. When the context carries a deadline,
/// each attempt is bounded by it.
///
/// # Errors
///
/// - Stage 1 and stage 2 errors as returned.
/// - [`CommandError::Conflict`] once conflict retries are exhausted.
/// - [`CommandError::AlreadyExists`] on a uniqueness violation.
/// - The prepared rejection, after its commands were pushed.
pub async fn execute<V: Validation>(
    store: &dyn EventStore,
    services: &Services,
    ctx: &CommandContext,
    validation: V,
) -> Result<Outcome<V::Output>, CommandError> {
    let span = tracing::info_span!(
        "execute_command",
        command = %command_name::<V>(),
        instance_id = %ctx.instance_id,
    );
    execute_in_span(store, services, ctx, validation)
        .instrument(span)
        .await
}

async fn execute_in_span<V: Validation>(
    store: &dyn EventStore,
    services: &Services,
    ctx: &CommandContext,
    validation: V,
) -> Result<Outcome<V::Output>, CommandError> {
    let prepared = validation.validate()?;
    let env = Env {
        filter: Filter::new(store, ctx),
        ctx,
        services,
    };
    let max_retries = services.config.max_conflict_retries;

    let mut retries = 0;
    loop {
        let attempt = run_attempt(store, &env, &prepared);
        let result = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, attempt)
                .await
                .map_err(|_| CommandError::from(GatewayError::Cancelled))?,
            None => attempt.await,
        }?;

        match result {
            Ok((events, output, rejection)) => {
                if let Some(rejection) = rejection {
                    tracing::warn!(error = %rejection, "command rejected after push");
                    return Err(rejection);
                }
                return Ok(Outcome {
                    details: ObjectDetails::from_events(&events),
                    output,
                });
            }
            Err(err) if err.is_retryable() => {
                if retries >= max_retries {
                    tracing::warn!(error = %err, retries, "conflict retries exhausted");
                    return Err(CommandError::Conflict);
                }
                retries += 1;
                tracing::warn!(error = %err, attempt = retries, "sequence conflict, retrying");
            }
            Err(err @ GatewayError::UniqueViolation { .. }) => return Err(err.into()),
            Err(err) => {
                tracing::error!(error = %err, "push failed");
                return Err(err.into());
            }
        }
    }
}

type Pushed<T> = (Vec<Event>, T, Option<CommandError>);

async fn run_attempt<C: CreateCommands>(
    store: &dyn EventStore,
    env: &Env<'_>,
    prepared: &C,
) -> Result<Result<Pushed<C::Output>, GatewayError>, CommandError> {
    let Prepared {
        mut commands,
        output,
        rejection,
    } = prepared.create_commands(env).await?;
    if commands.is_empty() {
        return Ok(Ok((Vec::new(), output, rejection)));
    }
    let now = env.now();
    for command in &mut commands {
        command.stamp(env.ctx, now);
    }
    Ok(store
        .push(env.ctx, commands)
        .await
        .map(|events| (events, output, rejection)))
}

fn command_name<V>() -> &'static str {
    let full = std::any::type_name::<V>();
    full.rsplit("::").next().unwrap_or(full)
}
