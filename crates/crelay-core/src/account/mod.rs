mod model;
mod repo;

pub use model::{
    AccountGroup, AccountId, AccountStatus, AccountView, CredentialMaterial, OutboundProxy,
    Provider, ProviderFamily, ProxyScheme, SelectionPolicy,
};
pub use repo::{AccountRepo, NewAccount, RepoError};
