//! Lissage de l'erreur de synchronisation
//!
//! Filtre de Kalman scalaire : réagit vite aux sauts (changement d'ancrage)
//! tout en rejetant la gigue par-buffer. Le facteur d'oubli gonfle la
//! variance au fil du temps pour que le filtre ne devienne jamais sourd aux
//! mesures.

/// Filtre scalaire suivant une erreur de synchronisation en µs.
pub struct TimeFilter {
    /// Bruit de process : croissance de l'incertitude par µs écoulée.
    process_std_dev: f64,
    /// Facteur d'oubli appliqué à la variance avant chaque mesure.
    forget_factor: f64,
    offset_us: f64,
    variance: f64,
    last_update_us: Option<i64>,
    samples: u32,
}

/// Nombre de mesures avant de considérer le filtre acquis.
const ACQUISITION_SAMPLES: u32 = 3;

impl TimeFilter {
    pub fn new(process_std_dev: f64, forget_factor: f64) -> Self {
        Self {
            process_std_dev,
            forget_factor,
            offset_us: 0.0,
            variance: 0.0,
            last_update_us: None,
            samples: 0,
        }
    }

    /// Intègre une mesure brute.
    ///
    /// `max_error_us` est l'écart-type attendu de la mesure (gigue réseau et
    /// buffer), `time_added_us` l'instant hôte de la mesure.
    pub fn update(&mut self, measurement_us: f64, max_error_us: f64, time_added_us: i64) {
        let measurement_variance = max_error_us * max_error_us;

        let Some(last) = self.last_update_us else {
            self.offset_us = measurement_us;
            self.variance = measurement_variance;
            self.last_update_us = Some(time_added_us);
            self.samples = 1;
            return;
        };

        // Prédiction : la variance gonfle avec le temps écoulé.
        let dt_us = (time_added_us - last).max(0) as f64;
        let process_noise = self.process_std_dev * dt_us;
        self.variance = self.variance * self.forget_factor + process_noise * process_noise;

        // Correction.
        let gain = self.variance / (self.variance + measurement_variance);
        self.offset_us += gain * (measurement_us - self.offset_us);
        self.variance *= 1.0 - gain;

        self.last_update_us = Some(time_added_us);
        self.samples = self.samples.saturating_add(1);
    }

    /// Erreur filtrée courante en µs.
    pub fn offset(&self) -> f64 {
        self.offset_us
    }

    /// Vrai une fois le filtre nourri d'assez de mesures.
    pub fn is_synchronized(&self) -> bool {
        self.samples >= ACQUISITION_SAMPLES
    }

    /// Revient à l'état non acquis.
    pub fn reset(&mut self) {
        self.offset_us = 0.0;
        self.variance = 0.0;
        self.last_update_us = None;
        self.samples = 0;
    }
}
