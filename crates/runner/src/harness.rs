//! Page-side harness programs.
//!
//! `BOOTSTRAP` runs in every new document before the page's own scripts. It
//! preconfigures QUnit not to start on its own and creates `__leakwatch`, a
//! single-slot rendezvous between the test runner and the host:
//!
//! - `signal(done)` fills the slot, or hands the value to a waiting `resume()`;
//!   an unconsumed `false` is overwritten by `true` (completion wins).
//! - `resume()` starts the suite on its first call and releases the paused
//!   test on every later call, then waits for the next signal.
//!
//! Tests are paused in a global `afterEach` hook that returns a promise, so
//! the runner cannot move on until the host resumes it.
//!
//! The pause happens before QUnit's own teardown and before `testEnd`. The
//! test's `this` environment and its callback are still reachable at that
//! point, so an instance stored only on the test context is reported even
//! though QUnit would release it moments later.

pub const BOOTSTRAP: &str = r#"(function () {
  if (window.__leakwatch) { return; }

  if (!window.QUnit) {
    window.QUnit = { config: { autostart: false } };
  } else if (window.QUnit.config) {
    window.QUnit.config.autostart = false;
  }

  var pending = undefined;
  var waiter = undefined;
  var gate = undefined;
  var started = false;
  var running = false;

  function signal(done) {
    if (waiter) {
      var resolve = waiter;
      waiter = undefined;
      resolve(done);
    } else if (pending !== true) {
      pending = done;
    }
  }

  function next() {
    return new Promise(function (resolve) {
      if (pending !== undefined) {
        var value = pending;
        pending = undefined;
        resolve(value);
      } else {
        waiter = resolve;
      }
    });
  }

  var state = {
    attached: false,
    counts: null,
    currentTest: null,

    attach: function (QUnit) {
      if (state.attached) { return true; }
      state.attached = true;

      QUnit.on('runStart', function () {
        running = true;
        console.debug('leakwatch: run start');
      });
      QUnit.on('testStart', function (test) {
        state.currentTest = { module: test.module || '', name: test.name || '' };
      });
      QUnit.hooks.afterEach(function () {
        signal(false);
        return new Promise(function (release) { gate = release; });
      });
      QUnit.on('testEnd', function (test) {
        console.debug('leakwatch: test end: ' + test.fullName.join(' > ') + ' (' + test.status + ')');
      });
      QUnit.on('runEnd', function (data) {
        var c = data.testCounts;
        state.counts = {
          passed: c.passed, failed: c.failed, skipped: c.skipped, todo: c.todo, total: c.total
        };
        console.log('Passed: ' + c.passed);
        console.log('Failed: ' + c.failed);
        console.log('Skipped: ' + c.skipped);
        console.log('Todo: ' + c.todo);
        console.log('Total: ' + c.total);
        signal(true);
      });
      return true;
    },

    resume: function () {
      if (!started) {
        started = true;
        if (!running) { window.QUnit.start(); }
      } else if (gate) {
        var release = gate;
        gate = undefined;
        release();
      }
      return next();
    }
  };

  window.__leakwatch = state;
})();
"#;

/// Entry points the harness needs. Evaluates to the list of missing ones.
pub const CAPABILITY_CHECK: &str = r#"(function () {
  var missing = [];
  var q = window.QUnit;
  if (!window.__leakwatch) { missing.push('__leakwatch'); }
  if (!q || typeof q.start !== 'function') { missing.push('QUnit.start'); }
  if (!q || typeof q.on !== 'function') { missing.push('QUnit.on'); }
  if (!q || !q.hooks || typeof q.hooks.afterEach !== 'function') { missing.push('QUnit.hooks.afterEach'); }
  return missing;
})()"#;

pub const ATTACH: &str = "window.__leakwatch.attach(window.QUnit)";

/// Resolves to `false` after each test and `true` once the run has ended.
pub const RESUME: &str = "window.__leakwatch.resume()";

pub const CURRENT_TEST: &str = "window.__leakwatch.currentTest";

pub const RUN_COUNTS: &str = "window.__leakwatch.counts";

pub const ATTACH_SOURCE_URL: &str = "leakwatch://harness/attach.js";
