//! Discriminator registry for collections that store several entity types.
//!
//! Each registered type gets a discriminator string written to
//! [`DISCRIMINATOR_FIELD`] and a decode/encode pair. The registry is built once
//! at startup and is immutable afterwards; [`install`] publishes it for the
//! whole process.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Field holding the type discriminator of a polymorphic document.
pub const DISCRIMINATOR_FIELD: &str = "_t";

type DecodeFn = fn(Value) -> CoreResult<Box<dyn Any + Send + Sync>>;
type EncodeFn = fn(&(dyn Any + Send + Sync)) -> CoreResult<Value>;

struct Codec {
    type_name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
}

fn decode_as<T>(body: Value) -> CoreResult<Box<dyn Any + Send + Sync>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Ok(Box::new(serde_json::from_value::<T>(body)?))
}

fn encode_as<T>(value: &(dyn Any + Send + Sync)) -> CoreResult<Value>
where
    T: Serialize + 'static,
{
    let typed = value.downcast_ref::<T>().ok_or_else(|| {
        CoreError::internal(format!(
            "registry encoder for `{}` received another type",
            std::any::type_name::<T>()
        ))
    })?;
    Ok(serde_json::to_value(typed)?)
}

/// A decoded polymorphic document.
pub struct DecodedDocument {
    pub discriminator: String,
    pub value: Box<dyn Any + Send + Sync>,
}

impl DecodedDocument {
    /// Takes the value as `T`, or gives the document back when it holds another type.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        let Self {
            discriminator,
            value,
        } = self;
        match value.downcast::<T>() {
            Ok(typed) => Ok(*typed),
            Err(value) => Err(Self {
                discriminator,
                value,
            }),
        }
    }
}

/// Collects registrations; duplicates are reported by [`build`](Self::build).
#[derive(Default)]
pub struct TypeRegistryBuilder {
    codecs: Vec<(String, TypeId, Codec)>,
}

impl TypeRegistryBuilder {
    /// Registers `T` under `discriminator`.
    #[must_use]
    pub fn register<T>(mut self, discriminator: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.codecs.push((
            discriminator.into(),
            TypeId::of::<T>(),
            Codec {
                type_name: std::any::type_name::<T>(),
                decode: decode_as::<T>,
                encode: encode_as::<T>,
            },
        ));
        self
    }

    /// Freezes the registrations.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when a discriminator or a type is registered twice.
    pub fn build(self) -> CoreResult<TypeRegistry> {
        let mut by_discriminator = HashMap::new();
        let mut by_type = HashMap::new();

        for (discriminator, type_id, codec) in self.codecs {
            if discriminator.is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "empty discriminator for `{}`",
                    codec.type_name
                )));
            }
            if by_type.insert(type_id, discriminator.clone()).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "type `{}` registered twice",
                    codec.type_name
                )));
            }
            if by_discriminator.insert(discriminator.clone(), codec).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "discriminator `{discriminator}` registered twice"
                )));
            }
        }

        Ok(TypeRegistry {
            by_discriminator,
            by_type,
        })
    }
}

/// Immutable discriminator → codec mapping.
pub struct TypeRegistry {
    by_discriminator: HashMap<String, Codec>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistry {
    #[must_use]
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Discriminator registered for `T`.
    #[must_use]
    pub fn discriminator_of<T: 'static>(&self) -> Option<&str> {
        self.by_type.get(&TypeId::of::<T>()).map(String::as_str)
    }

    /// Registered discriminators, sorted.
    #[must_use]
    pub fn discriminators(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_discriminator.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Serializes a registered value and tags it with its discriminator.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for unregistered types or non-object bodies.
    pub fn encode(&self, value: &(dyn Any + Send + Sync)) -> CoreResult<Value> {
        let discriminator = self.by_type.get(&(*value).type_id()).ok_or_else(|| {
            CoreError::ValidationError("value type is not registered".into())
        })?;
        let codec = &self.by_discriminator[discriminator];
        let mut body = (codec.encode)(value)?;
        tag(&mut body, discriminator)?;
        Ok(body)
    }

    /// Decodes a tagged document with the codec its discriminator names.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationError` for a missing or unknown discriminator,
    /// or when the body does not fit the registered type.
    pub fn decode(&self, doc: Value) -> CoreResult<DecodedDocument> {
        let discriminator = doc
            .get(DISCRIMINATOR_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::DeserializationError("document carries no discriminator".into())
            })?
            .to_string();
        let codec = self.by_discriminator.get(&discriminator).ok_or_else(|| {
            CoreError::DeserializationError(format!("unknown discriminator `{discriminator}`"))
        })?;

        let value = (codec.decode)(crate::document::strip_reserved(doc))?;
        Ok(DecodedDocument {
            discriminator,
            value,
        })
    }
}

/// Writes `discriminator` into an object body.
///
/// # Errors
///
/// Returns `ValidationError` when the body is not an object.
pub fn tag(body: &mut Value, discriminator: &str) -> CoreResult<()> {
    let object = body.as_object_mut().ok_or_else(|| {
        CoreError::ValidationError("tagged values must serialize to an object".into())
    })?;
    object.insert(
        DISCRIMINATOR_FIELD.to_string(),
        Value::String(discriminator.to_string()),
    );
    Ok(())
}

static GLOBAL: OnceCell<TypeRegistry> = OnceCell::new();

/// Publishes the process-wide registry.
///
/// # Errors
///
/// Returns `InvalidState` when a registry was already installed.
pub fn install(registry: TypeRegistry) -> CoreResult<&'static TypeRegistry> {
    GLOBAL
        .set(registry)
        .map_err(|_| CoreError::invalid_state("type registry is already installed"))?;
    global().ok_or_else(|| CoreError::internal("type registry vanished after install"))
}

/// The process-wide registry, if one was installed.
#[must_use]
pub fn global() -> Option<&'static TypeRegistry> {
    GLOBAL.get()
}
