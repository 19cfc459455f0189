use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use nalgebra::DVector;
use ordered_float::OrderedFloat;
use tracing::trace;

use super::equation::{
    Equation, EquationData, EquationEventType, EquationKey, EquationTermEventType, EquationType,
    EquationUpdateType,
};
use super::initializer::VoltageInitializer;
use super::term::{EquationTerm, StateView, TermId};
use super::variable::Variable;
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{LfNetwork, Subject};

/// Mismatches at or below this value are not reported as largest.
pub const MISMATCH_NOISE_FLOOR: f64 = 1e-7;

/// Receives the structural and state events of an [`EquationSystem`].
///
/// Listeners are notified synchronously, in registration order, after the
/// index cache has been invalidated.
pub trait EquationSystemListener {
    fn on_equation_change(&mut self, equation: EquationKey, event: EquationEventType);

    fn on_equation_term_change(&mut self, term: TermId, event: EquationTermEventType);

    fn on_state_update(&mut self, _x: &[f64]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

#[derive(Debug)]
struct TermSlot {
    term: Box<dyn EquationTerm>,
    active: bool,
    equation: EquationKey,
}

/// An equation of the index together with its active terms grouped by
/// variable.
#[derive(Debug, Clone)]
pub struct IndexedEquation {
    pub key: EquationKey,
    pub terms_by_variable: BTreeMap<Variable, Vec<TermId>>,
}

/// Dense numbering of the active equations (columns) and of the variables
/// they reference (rows).
#[derive(Debug, Default, Clone)]
pub struct EquationIndex {
    equations: Vec<IndexedEquation>,
    variables: Vec<Variable>,
    rows: HashMap<Variable, usize>,
}

impl EquationIndex {
    /// Indexed equations, position is the column.
    pub fn equations(&self) -> &[IndexedEquation] {
        &self.equations
    }

    /// Indexed variables, position is the row.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn row(&self, variable: Variable) -> Option<usize> {
        self.rows.get(&variable).copied()
    }

    pub fn equation_count(&self) -> usize {
        self.equations.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

#[derive(Debug)]
struct IndexCache {
    index: EquationIndex,
    invalid: bool,
    rebuild_count: usize,
}

/// Registry of equations and terms, with a lazily rebuilt dense index.
///
/// Every structural change (equation created, removed, (de)activated or its
/// update type changed, term added or (de)activated) invalidates the index
/// and is forwarded to the registered listeners. Activating an equation or
/// term that is already active is a no-op and fires nothing.
pub struct EquationSystem {
    equations: BTreeMap<EquationKey, Equation>,
    terms: Vec<TermSlot>,
    terms_by_subject: Option<HashMap<Subject, Vec<TermId>>>,
    cache: IndexCache,
    listeners: Vec<(ListenerId, Box<dyn EquationSystemListener>)>,
    next_listener_id: usize,
}

impl Default for EquationSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl EquationSystem {
    pub fn new() -> Self {
        Self {
            equations: BTreeMap::new(),
            terms: Vec::new(),
            terms_by_subject: None,
            cache: IndexCache {
                index: EquationIndex::default(),
                invalid: true,
                rebuild_count: 0,
            },
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// Creates a system that also maintains a term lookup by network element.
    pub fn with_term_index() -> Self {
        let mut system = Self::new();
        system.terms_by_subject = Some(HashMap::new());
        system
    }

    fn notify_equation(&mut self, key: EquationKey, event: EquationEventType) {
        trace!(equation = %key, ?event, "equation event");
        self.cache.invalid = true;
        for (_, listener) in self.listeners.iter_mut() {
            listener.on_equation_change(key, event);
        }
    }

    fn notify_term(&mut self, term: TermId, event: EquationTermEventType) {
        self.cache.invalid = true;
        for (_, listener) in self.listeners.iter_mut() {
            listener.on_equation_term_change(term, event);
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn EquationSystemListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` when the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Returns the equation for `(num, ty)`, creating it if needed.
    pub fn create_equation(&mut self, num: usize, ty: EquationType) -> EquationKey {
        let key = EquationKey::new(num, ty);
        if !self.equations.contains_key(&key) {
            self.equations.insert(key, Equation::new(key));
            self.notify_equation(key, EquationEventType::Created);
        }
        key
    }

    pub fn has_equation(&self, num: usize, ty: EquationType) -> bool {
        self.equations.contains_key(&EquationKey::new(num, ty))
    }

    pub fn equation(&self, key: EquationKey) -> Result<&Equation> {
        self.equations
            .get(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))
    }

    pub fn find_equation(&self, num: usize, ty: EquationType) -> Option<&Equation> {
        self.equations.get(&EquationKey::new(num, ty))
    }

    /// All equations, sorted by key.
    pub fn equations(&self) -> impl Iterator<Item = &Equation> {
        self.equations.values()
    }

    pub fn remove_equation(&mut self, key: EquationKey) -> Result<Equation> {
        let equation = self
            .equations
            .remove(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))?;
        for &id in equation.terms() {
            self.terms[id.0].active = false;
            if let Some(index) = self.terms_by_subject.as_mut() {
                let subject = self.terms[id.0].term.subject();
                if let Some(ids) = index.get_mut(&subject) {
                    ids.retain(|t| *t != id);
                }
            }
        }
        self.notify_equation(key, EquationEventType::Removed);
        Ok(equation)
    }

    /// Attaches a term to an existing equation.
    pub fn add_term<T: EquationTerm + 'static>(&mut self, key: EquationKey, term: T) -> Result<TermId> {
        self.add_boxed_term(key, Box::new(term))
    }

    pub fn add_boxed_term(&mut self, key: EquationKey, term: Box<dyn EquationTerm>) -> Result<TermId> {
        let equation = self
            .equations
            .get_mut(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))?;
        let id = TermId(self.terms.len());
        equation.push_term(id);
        if let Some(index) = self.terms_by_subject.as_mut() {
            index.entry(term.subject()).or_default().push(id);
        }
        self.terms.push(TermSlot {
            term,
            active: true,
            equation: key,
        });
        self.notify_term(id, EquationTermEventType::Added);
        Ok(id)
    }

    /// Returns whether the state actually changed.
    pub fn set_equation_active(&mut self, key: EquationKey, active: bool) -> Result<bool> {
        let equation = self
            .equations
            .get_mut(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))?;
        if equation.is_active() == active {
            return Ok(false);
        }
        equation.set_active(active);
        if !active {
            equation.set_column(None);
        }
        let event = if active {
            EquationEventType::Activated
        } else {
            EquationEventType::Deactivated
        };
        self.notify_equation(key, event);
        Ok(true)
    }

    /// Returns whether the state actually changed.
    pub fn set_term_active(&mut self, id: TermId, active: bool) -> Result<bool> {
        let slot = self.terms.get_mut(id.0).ok_or(LoadFlowError::UnknownTerm(id))?;
        if slot.active == active {
            return Ok(false);
        }
        slot.active = active;
        let event = if active {
            EquationTermEventType::Activated
        } else {
            EquationTermEventType::Deactivated
        };
        self.notify_term(id, event);
        Ok(true)
    }

    pub fn set_equation_update_type(&mut self, key: EquationKey, update_type: EquationUpdateType) -> Result<()> {
        let equation = self
            .equations
            .get_mut(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))?;
        if equation.update_type() != update_type {
            equation.set_update_type(update_type);
            self.notify_equation(key, EquationEventType::UpdateTypeChanged);
        }
        Ok(())
    }

    pub fn set_equation_data(&mut self, key: EquationKey, data: EquationData) -> Result<()> {
        self.equations
            .get_mut(&key)
            .ok_or(LoadFlowError::UnknownEquation(key))?
            .set_data(Some(data));
        Ok(())
    }

    pub fn term(&self, id: TermId) -> Result<&dyn EquationTerm> {
        self.terms
            .get(id.0)
            .map(|slot| slot.term.as_ref())
            .ok_or(LoadFlowError::UnknownTerm(id))
    }

    pub fn is_term_active(&self, id: TermId) -> Result<bool> {
        self.terms
            .get(id.0)
            .map(|slot| slot.active)
            .ok_or(LoadFlowError::UnknownTerm(id))
    }

    /// Equation owning the term.
    pub fn term_equation(&self, id: TermId) -> Result<EquationKey> {
        self.terms
            .get(id.0)
            .map(|slot| slot.equation)
            .ok_or(LoadFlowError::UnknownTerm(id))
    }

    /// Terms attached to a network element. Needs a system created with
    /// [`EquationSystem::with_term_index`].
    pub fn terms_by_subject(&self, subject: Subject) -> Result<&[TermId]> {
        let index = self.terms_by_subject.as_ref().ok_or_else(|| {
            LoadFlowError::Structural("equation terms are not indexed by subject".to_string())
        })?;
        Ok(index.get(&subject).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Marks the index stale without any structural change.
    pub fn invalidate_index(&mut self) {
        self.cache.invalid = true;
    }

    pub fn is_index_valid(&self) -> bool {
        !self.cache.invalid
    }

    /// Number of times the index has actually been rebuilt.
    pub fn rebuild_count(&self) -> usize {
        self.cache.rebuild_count
    }

    /// Returns the index, rebuilding it first if a structural change
    /// happened since the last build.
    pub fn index(&mut self) -> Result<&EquationIndex> {
        self.ensure_index()?;
        Ok(&self.cache.index)
    }

    /// Index as last built, failing if it is stale.
    pub fn current_index(&self) -> Result<&EquationIndex> {
        if self.cache.invalid {
            return Err(LoadFlowError::Structural(
                "equation index is out of date".to_string(),
            ));
        }
        Ok(&self.cache.index)
    }

    fn ensure_index(&mut self) -> Result<()> {
        if !self.cache.invalid {
            return Ok(());
        }
        let mut indexed = Vec::new();
        let mut variables = BTreeSet::new();
        for (key, equation) in &self.equations {
            if !equation.is_active() || equation.update_type() != EquationUpdateType::Default {
                continue;
            }
            let mut terms_by_variable: BTreeMap<Variable, Vec<TermId>> = BTreeMap::new();
            let mut has_active_term = false;
            for &id in equation.terms() {
                let slot = &self.terms[id.0];
                if !slot.active {
                    continue;
                }
                has_active_term = true;
                for &variable in slot.term.variables() {
                    terms_by_variable.entry(variable).or_default().push(id);
                    variables.insert(variable);
                }
            }
            if !has_active_term {
                return Err(LoadFlowError::Consistency(*key));
            }
            indexed.push(IndexedEquation {
                key: *key,
                terms_by_variable,
            });
        }

        for equation in self.equations.values_mut() {
            equation.set_column(None);
        }
        for (column, eq) in indexed.iter().enumerate() {
            if let Some(equation) = self.equations.get_mut(&eq.key) {
                equation.set_column(Some(column));
            }
        }
        let variables: Vec<Variable> = variables.into_iter().collect();
        let rows = variables.iter().enumerate().map(|(row, v)| (*v, row)).collect();

        self.cache.index = EquationIndex {
            equations: indexed,
            variables,
            rows,
        };
        self.cache.invalid = false;
        self.cache.rebuild_count += 1;
        trace!(
            equations = self.cache.index.equation_count(),
            variables = self.cache.index.variable_count(),
            "equation index rebuilt"
        );
        Ok(())
    }

    /// Indexed equations in column order.
    pub fn sorted_equations(&mut self) -> Result<Vec<EquationKey>> {
        Ok(self.index()?.equations.iter().map(|e| e.key).collect())
    }

    /// Indexed variables in row order.
    pub fn sorted_variables(&mut self) -> Result<Vec<Variable>> {
        Ok(self.index()?.variables.clone())
    }

    pub fn variable_row(&mut self, variable: Variable) -> Result<Option<usize>> {
        Ok(self.index()?.row(variable))
    }

    pub fn create_state_vector(
        &mut self,
        network: &LfNetwork,
        initializer: &dyn VoltageInitializer,
    ) -> Result<DVector<f64>> {
        let index = self.index()?;
        let mut x = DVector::zeros(index.variable_count());
        for (row, variable) in index.variables.iter().enumerate() {
            x[row] = variable.init_state(initializer, network)?;
        }
        Ok(x)
    }

    /// Target of one equation: the network target minus the constant parts
    /// of its active terms.
    pub fn init_target(&self, key: EquationKey, network: &LfNetwork) -> Result<f64> {
        let equation = self.equation(key)?;
        let mut target = equation.network_target(network)?;
        for &id in equation.terms() {
            let slot = &self.terms[id.0];
            if slot.active && slot.term.has_rhs() {
                target -= slot.term.rhs();
            }
        }
        Ok(target)
    }

    pub fn create_target_vector(&mut self, network: &LfNetwork) -> Result<DVector<f64>> {
        self.ensure_index()?;
        let index = &self.cache.index;
        let mut targets = DVector::zeros(index.equation_count());
        for (column, eq) in index.equations.iter().enumerate() {
            targets[column] = self.init_target(eq.key, network)?;
        }
        Ok(targets)
    }

    /// Sum of the active terms of an equation, as last updated, minus their
    /// constant parts.
    pub fn eval_equation(&self, key: EquationKey) -> Result<f64> {
        let equation = self.equation(key)?;
        let mut value = 0.0;
        for slot in equation.terms().iter().map(|id| &self.terms[id.0]) {
            if !slot.active {
                continue;
            }
            value += slot.term.eval();
            if slot.term.has_rhs() {
                value -= slot.term.rhs();
            }
        }
        Ok(value)
    }

    pub fn create_equation_vector(&mut self) -> Result<DVector<f64>> {
        self.ensure_index()?;
        let mut fx = DVector::zeros(self.cache.index.equation_count());
        self.update_equation_vector(fx.as_mut_slice())?;
        Ok(fx)
    }

    pub fn update_equation_vector(&mut self, fx: &mut [f64]) -> Result<()> {
        self.ensure_index()?;
        let index = &self.cache.index;
        if fx.len() != index.equation_count() {
            return Err(LoadFlowError::BadVectorLength {
                expected: index.equation_count(),
                actual: fx.len(),
            });
        }
        for (column, eq) in index.equations.iter().enumerate() {
            fx[column] = self.eval_equation(eq.key)?;
        }
        Ok(())
    }

    /// Refreshes the active terms of every equation of the given update
    /// type, then forwards the state to the listeners.
    pub fn update_equations(&mut self, x: &[f64], update_type: EquationUpdateType) -> Result<()> {
        self.ensure_index()?;
        let expected = self.cache.index.variable_count();
        if x.len() != expected {
            return Err(LoadFlowError::BadVectorLength {
                expected,
                actual: x.len(),
            });
        }
        let view = StateView::new(x, &self.cache.index.rows);
        let terms = &mut self.terms;
        for equation in self.equations.values() {
            if equation.update_type() != update_type {
                continue;
            }
            for id in equation.terms() {
                let slot = &mut terms[id.0];
                if slot.active {
                    slot.term.update(&view);
                }
            }
        }
        for (_, listener) in self.listeners.iter_mut() {
            listener.on_state_update(x);
        }
        Ok(())
    }

    /// Writes every indexed variable of `x` back to the network.
    pub fn update_network(&mut self, x: &[f64], network: &mut LfNetwork) -> Result<()> {
        let index = self.index()?;
        if x.len() != index.variable_count() {
            return Err(LoadFlowError::BadVectorLength {
                expected: index.variable_count(),
                actual: x.len(),
            });
        }
        for (row, variable) in index.variables.iter().enumerate() {
            variable.update_state(network, x[row])?;
        }
        Ok(())
    }

    /// The `count` equations with the largest absolute mismatch, largest
    /// first. Mismatches below [`MISMATCH_NOISE_FLOOR`] are left out. Uses
    /// the index as last built.
    pub fn find_largest_mismatches(
        &self,
        mismatch: &[f64],
        count: usize,
    ) -> Result<Vec<(EquationKey, f64)>> {
        let index = self.current_index()?;
        if mismatch.len() != index.equation_count() {
            return Err(LoadFlowError::BadVectorLength {
                expected: index.equation_count(),
                actual: mismatch.len(),
            });
        }
        let mut largest: Vec<(EquationKey, f64)> = index
            .equations
            .iter()
            .zip(mismatch)
            .map(|(eq, &m)| (eq.key, m))
            .filter(|(_, m)| m.abs() > MISMATCH_NOISE_FLOOR)
            .collect();
        largest.sort_by_key(|(_, m)| std::cmp::Reverse(OrderedFloat(m.abs())));
        largest.truncate(count);
        Ok(largest)
    }

    /// Names of the indexed variables, in row order.
    pub fn row_names(&mut self) -> Result<Vec<String>> {
        Ok(self.index()?.variables.iter().map(|v| v.to_string()).collect())
    }

    /// Names of the indexed equations, in column order.
    pub fn column_names(&mut self) -> Result<Vec<String>> {
        Ok(self.index()?.equations.iter().map(|e| e.key.to_string()).collect())
    }

    /// Human readable dump of the active equations.
    pub fn write_equations(&self) -> String {
        let mut out = String::new();
        for equation in self.equations.values().filter(|e| e.is_active()) {
            let _ = write!(out, "{} = ", equation.key());
            let mut first = true;
            for &id in equation.terms() {
                let slot = &self.terms[id.0];
                if !slot.active {
                    continue;
                }
                if !first {
                    out.push_str(" + ");
                }
                let _ = slot.term.write(&mut out);
                first = false;
            }
            out.push('\n');
        }
        out
    }
}
