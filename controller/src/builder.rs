use crate::integration::TemplateVariables;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("An analysis needs at least one query")]
    NoQueries,

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Transform expects queries {expected:?}, builders produce {actual:?}")]
    ShapeMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Query text plus the variables the integration substitutes into it.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltQuery {
    pub name: String,
    pub sql: String,
    pub vars: TemplateVariables,
}

/// Turns analysis parameters into one warehouse query.
pub trait QueryBuilder<P>: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, params: &P) -> Result<BuiltQuery, BuildError>;
}

struct FnBuilder<F> {
    name: String,
    build: F,
}

impl<P, F> QueryBuilder<P> for FnBuilder<F>
where
    F: Fn(&P) -> Result<(String, TemplateVariables), BuildError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, params: &P) -> Result<BuiltQuery, BuildError> {
        let (sql, vars) = (self.build)(params)?;
        Ok(BuiltQuery {
            name: self.name.clone(),
            sql,
            vars,
        })
    }
}

/// Builder backed by a closure returning query text and variables.
pub fn query_builder<P, F>(name: impl Into<String>, build: F) -> Box<dyn QueryBuilder<P>>
where
    P: 'static,
    F: Fn(&P) -> Result<(String, TemplateVariables), BuildError> + Send + Sync + 'static,
{
    Box::new(FnBuilder {
        name: name.into(),
        build,
    })
}

/// Builder for a fixed query that ignores the parameters.
pub fn static_query<P: 'static>(
    name: impl Into<String>,
    sql: impl Into<String>,
) -> Box<dyn QueryBuilder<P>> {
    let sql = sql.into();
    query_builder(name, move |_: &P| Ok((sql.clone(), TemplateVariables::new())))
}

/// Builds every query up front so that nothing is persisted when one fails.
pub fn build_all<P>(
    builders: &[Box<dyn QueryBuilder<P>>],
    params: &P,
    expected: Option<&[&str]>,
) -> Result<Vec<BuiltQuery>, BuildError> {
    if builders.is_empty() {
        return Err(BuildError::NoQueries);
    }
    if let Some(expected) = expected {
        let actual: Vec<&str> = builders.iter().map(|b| b.name()).collect();
        if actual != expected {
            return Err(BuildError::ShapeMismatch {
                expected: expected.iter().map(|s| s.to_string()).collect(),
                actual: actual.iter().map(|s| s.to_string()).collect(),
            });
        }
    }
    builders.iter().map(|b| b.build(params)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lookback {
        days: u32,
    }

    fn lookback_builder() -> Box<dyn QueryBuilder<Lookback>> {
        query_builder("events", |p: &Lookback| {
            if p.days == 0 {
                return Err(BuildError::InvalidParam {
                    name: "lookbackDays".into(),
                    reason: "must be positive".into(),
                });
            }
            Ok((
                "SELECT count(*) FROM events WHERE age_days <= {{days}}".into(),
                TemplateVariables::from([("days".to_string(), p.days.to_string())]),
            ))
        })
    }

    #[test]
    fn build_all_checks_names_before_building() {
        let builders = vec![lookback_builder(), static_query("extra", "SELECT 1")];
        let err = build_all(&builders, &Lookback { days: 0 }, Some(&["events"])).unwrap_err();
        assert!(matches!(err, BuildError::ShapeMismatch { .. }));
    }

    #[test]
    fn build_all_surfaces_param_errors() {
        let builders = vec![lookback_builder()];
        assert!(matches!(
            build_all(&builders, &Lookback { days: 0 }, None),
            Err(BuildError::InvalidParam { .. })
        ));

        let built = build_all(&builders, &Lookback { days: 7 }, Some(&["events"])).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name, "events");
        assert_eq!(built[0].vars["days"], "7");
    }

    #[test]
    fn no_builders_is_an_error() {
        let builders: Vec<Box<dyn QueryBuilder<Lookback>>> = vec![];
        assert_eq!(
            build_all(&builders, &Lookback { days: 1 }, None),
            Err(BuildError::NoQueries)
        );
    }
}
